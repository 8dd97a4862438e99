use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use haven_shared::constants::{
    LONG_POLL_HEADER, MAX_REQUEST_BODY, SNODE_SENDER_HEADER, SNODE_SIGNATURE_HEADER,
};
use haven_shared::identity::verify_request_signature;
use haven_shared::{parse_combined_payload, EncryptType, LegacyPubkey, X25519Pubkey};

use crate::error::ServerError;
use crate::handler::{RequestHandler, RpcResponse};
use crate::node::{now_ms, Node};
use crate::onion::{OnionMeta, OnionProcessor};
use crate::rate_limit::RateLimiter;
use crate::storage_test::run_storage_test;
use crate::workers::WorkerPool;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub workers: Arc<WorkerPool>,
    pub limiter: Arc<RateLimiter>,
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/storage_rpc/v1", post(storage_rpc))
        .route("/onion_req/v2", post(onion_req))
        .route("/swarms/ping_test/v1", post(ping_test))
        .route("/swarms/storage_test/v1", post(storage_test))
        .route("/get_stats/v1", get(get_stats))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            generic_headers,
        ))
        .layer(TraceLayer::new_for_http());

    if state.node.config.cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}

/// Every response carries the server banner and the signature binding the
/// served certificate to this node's registered keys.
async fn generic_headers(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    if let Ok(banner) = HeaderValue::from_str(&format!("haven-storage/{SERVER_VERSION}")) {
        headers.insert("server", banner);
    }
    if let Ok(sig) = HeaderValue::from_str(state.node.cert_signature()) {
        headers.insert("x-haven-snode-signature", sig);
    }
    res
}

fn client_ipv4(addr: &SocketAddr) -> Option<std::net::Ipv4Addr> {
    match addr {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    }
}

async fn storage_rpc(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Result<RpcResponse, ServerError> {
    // Published snode addresses are IPv4 only; anything else is not a
    // client we can serve.
    let Some(ip) = client_ipv4(&addr) else {
        warn!("Incoming client request is not IPv4; dropping it");
        return Err(ServerError::BadRequest("IPv4 only".into()));
    };
    if state.limiter.should_rate_limit_client(ip) {
        debug!(client = %ip, "Rate limiting client request");
        return Err(ServerError::RateLimited);
    }
    if headers.contains_key(LONG_POLL_HEADER) {
        return Err(ServerError::LongPollingGone);
    }
    state.node.snode_ready().map_err(ServerError::NotReady)?;

    let handler = RequestHandler::new(state.node.clone());
    let (tx, rx) = oneshot::channel();
    state
        .workers
        .try_inject("storage_rpc", async move {
            let res = handler.process_client_req(&body).await;
            let _ = tx.send(res);
        })
        .map_err(|_| ServerError::Busy)?;

    rx.await
        .map_err(|_| ServerError::Internal("worker dropped the request".into()))
}

async fn onion_req(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<RpcResponse, ServerError> {
    state.node.snode_ready().map_err(ServerError::NotReady)?;

    let processor = OnionProcessor::new(state.node.clone());
    let (tx, rx) = oneshot::channel();
    state
        .workers
        .try_inject("onion_req", async move {
            let res = match parse_onion_frame(&body) {
                Ok((ciphertext, meta)) => processor.process_onion_req(&ciphertext, meta).await,
                Err(msg) => {
                    debug!(error = %msg, "Error parsing onion request");
                    RpcResponse::plain(StatusCode::BAD_REQUEST, msg)
                }
            };
            let _ = tx.send(res);
        })
        .map_err(|_| ServerError::Busy)?;

    rx.await
        .map_err(|_| ServerError::Internal("worker dropped the request".into()))
}

fn parse_onion_frame(body: &[u8]) -> Result<(Vec<u8>, OnionMeta), String> {
    let (ciphertext, json) = parse_combined_payload(body)
        .map_err(|e| format!("Error parsing onion request: {e}"))?;

    let ephem_key = json
        .get("ephemeral_key")
        .and_then(Value::as_str)
        .ok_or_else(|| "Error parsing onion request: missing ephemeral_key".to_string())?;
    let ephem_key = X25519Pubkey::from_hex(ephem_key)
        .map_err(|e| format!("Failed to decode ephemeral key: {e}"))?;

    let enc_type = match json.get("enc_type").and_then(Value::as_str) {
        Some(s) => EncryptType::parse(s).map_err(|e| e.to_string())?,
        None => EncryptType::AesGcm,
    };

    // A fake starting hop number is allowed, so intermediate hops cannot
    // tell where in the chain they sit.
    let hop_no = json
        .get("hop_no")
        .and_then(Value::as_i64)
        .map(|n| n.max(0) as u32)
        .unwrap_or(0);

    Ok((
        ciphertext,
        OnionMeta {
            ephem_key,
            enc_type,
            hop_no,
        },
    ))
}

async fn ping_test(State(state): State<AppState>) -> StatusCode {
    state.node.stats.record_ping_https(now_ms());
    StatusCode::OK
}

/// Peer requests carry the sender's legacy pubkey and a signature over the
/// body; the sender must be a currently-known snode.
fn validate_snode_request(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<LegacyPubkey, ServerError> {
    let sender = headers
        .get(SNODE_SENDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest("missing snode sender header".into()))?;
    let signature = headers
        .get(SNODE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest("missing snode signature header".into()))?;

    let sender = LegacyPubkey::from_base32z(sender)
        .map_err(|_| ServerError::BadRequest("invalid snode sender header".into()))?;

    if state.node.tracker.snapshot().find_node(&sender).is_none() {
        debug!(sender = %sender, "Discarding signature from unknown service node");
        return Err(ServerError::Unauthorized("Unknown service node".into()));
    }

    verify_request_signature(&sender, body, signature)
        .map_err(|_| ServerError::Unauthorized("Could not verify signature".into()))?;

    if state.limiter.should_rate_limit_peer(sender) {
        return Err(ServerError::RateLimited);
    }

    Ok(sender)
}

async fn storage_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<RpcResponse, ServerError> {
    state.node.snode_ready().map_err(ServerError::NotReady)?;
    let tester = validate_snode_request(&state, &headers, &body)?;

    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|_| ServerError::BadRequest("invalid json".into()))?;
    let height = parsed
        .get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| ServerError::BadRequest("missing fields in json".into()))?;
    let msg_hash = parsed
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::BadRequest("missing fields in json".into()))?
        .to_string();

    let node = state.node.clone();
    let (tx, rx) = oneshot::channel();
    state
        .workers
        .try_inject("storage_test", async move {
            let res = run_storage_test(node, height, tester, msg_hash).await;
            let _ = tx.send(res);
        })
        .map_err(|_| ServerError::Busy)?;

    rx.await
        .map_err(|_| ServerError::Internal("worker dropped the request".into()))
}

async fn get_stats(State(state): State<AppState>) -> RpcResponse {
    let mut stats = state.node.stats.snapshot(SERVER_VERSION);
    stats["worker_queues"] = serde_json::json!(state.workers.queue_depths());
    RpcResponse::ok_json(stats)
}

async fn not_found(req: Request) -> (StatusCode, String) {
    debug!(method = %req.method(), uri = %req.uri(), "Invalid HTTP request");
    (
        StatusCode::NOT_FOUND,
        format!("{} {} Not Found", req.method(), req.uri().path()),
    )
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTPS front-end");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use haven_shared::types::{BlockUpdate, SnodeRecord, SwarmInfo};
    use haven_shared::Identity;

    use crate::config::Config;

    fn test_state() -> AppState {
        let node = Arc::new(Node::new(Config::default(), Identity::generate()).unwrap());
        let us = SnodeRecord {
            ip: std::net::Ipv4Addr::new(10, 0, 0, 1),
            port_https: 443,
            port_mq: 5555,
            pubkey_legacy: node.identity.legacy_pubkey(),
            pubkey_ed25519: node.identity.ed25519_pubkey(),
            pubkey_x25519: node.identity.x25519_pubkey(),
        };
        node.tracker.apply_block_update(BlockUpdate {
            swarms: vec![SwarmInfo {
                swarm_id: 0,
                snodes: vec![us],
            }],
            ..Default::default()
        });
        AppState {
            limiter: Arc::new(RateLimiter::new(&node.config)),
            workers: Arc::new(WorkerPool::new(2, 64)),
            node,
        }
    }

    fn with_client(mut req: HttpRequest<Body>) -> HttpRequest<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        req
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let app = build_router(test_state());
        let res = app
            .oneshot(
                HttpRequest::get("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ping_returns_200_with_generic_headers() {
        let state = test_state();
        let app = build_router(state.clone());
        let res = app
            .oneshot(
                HttpRequest::post("/swarms/ping_test/v1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("server").unwrap().to_str().unwrap(),
            format!("haven-storage/{SERVER_VERSION}")
        );
        assert_eq!(
            res.headers()
                .get("x-haven-snode-signature")
                .unwrap()
                .to_str()
                .unwrap(),
            state.node.cert_signature()
        );
    }

    #[tokio::test]
    async fn test_get_stats_reports_version() {
        let app = build_router(test_state());
        let res = app
            .oneshot(
                HttpRequest::get("/get_stats/v1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], SERVER_VERSION);
    }

    #[tokio::test]
    async fn test_storage_rpc_roundtrip() {
        let app = build_router(test_state());
        let body = serde_json::json!({
            "method": "retrieve",
            "params": { "pubKey": format!("05{}1", "0".repeat(63)), "lastHash": "" },
        })
        .to_string();
        let res = app
            .oneshot(with_client(
                HttpRequest::post("/storage_rpc/v1")
                    .body(Body::from(body))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_poll_header_is_gone() {
        let app = build_router(test_state());
        let res = app
            .oneshot(with_client(
                HttpRequest::post("/storage_rpc/v1")
                    .header(LONG_POLL_HEADER, "true")
                    .body(Body::from("{}"))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_client_rate_limit_hits_429() {
        let state = test_state();
        let app = build_router(state.clone());
        let burst = state.node.config.client_burst as usize;
        for _ in 0..burst {
            let res = app
                .clone()
                .oneshot(with_client(
                    HttpRequest::post("/storage_rpc/v1")
                        .body(Body::from("{}"))
                        .unwrap(),
                ))
                .await
                .unwrap();
            assert_ne!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        let res = app
            .oneshot(with_client(
                HttpRequest::post("/storage_rpc/v1")
                    .body(Body::from("{}"))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_storage_test_requires_signature_headers() {
        let app = build_router(test_state());
        let res = app
            .oneshot(
                HttpRequest::post("/swarms/storage_test/v1")
                    .body(Body::from("{\"height\":1,\"hash\":\"aa\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_storage_test_rejects_unknown_sender() {
        let app = build_router(test_state());
        let outsider = Identity::generate();
        let body = "{\"height\":1,\"hash\":\"aa\"}";
        let res = app
            .oneshot(
                HttpRequest::post("/swarms/storage_test/v1")
                    .header(SNODE_SENDER_HEADER, outsider.legacy_pubkey().to_base32z())
                    .header(SNODE_SIGNATURE_HEADER, outsider.sign_request(body.as_bytes()))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_storage_test_rejects_bad_signature() {
        let state = test_state();
        let app = build_router(state.clone());
        let body = "{\"height\":1,\"hash\":\"aa\"}";
        let res = app
            .oneshot(
                HttpRequest::post("/swarms/storage_test/v1")
                    .header(
                        SNODE_SENDER_HEADER,
                        state.node.identity.legacy_pubkey().to_base32z(),
                    )
                    .header(
                        SNODE_SIGNATURE_HEADER,
                        state.node.identity.sign_request(b"different body"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_onion_req_bad_frame_is_400() {
        let app = build_router(test_state());
        let res = app
            .oneshot(
                HttpRequest::post("/onion_req/v2")
                    .body(Body::from(vec![1u8, 2, 3]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
