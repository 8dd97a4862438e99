use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use tracing::{debug, error, trace};

use haven_net::NetError;
use haven_shared::constants::MAX_MESSAGE_BODY;
use haven_shared::types::{Message, SnodeRecord};
use haven_shared::UserPubkey;

use crate::node::{now_ms, Node};

/// RPC endpoints the daemon forward is limited to; enforced before any
/// request leaves this process.
const ALLOWED_DAEMON_ENDPOINTS: [&str; 2] = ["get_service_nodes", "ons_resolve"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Plaintext,
    Json,
}

/// A finished RPC result, still abstract of the transport: the HTTPS edge
/// turns it into an axum response, the onion layer wraps and encrypts it.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub status: StatusCode,
    pub body: String,
    pub content_type: ContentType,
}

impl RpcResponse {
    pub fn ok_json(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.to_string(),
            content_type: ContentType::Json,
        }
    }

    /// A body passed through from an upstream verbatim.
    pub fn ok_json_raw(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            body: String::from_utf8_lossy(&body).into_owned(),
            content_type: ContentType::Json,
        }
    }

    pub fn plain(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: ContentType::Plaintext,
        }
    }
}

impl IntoResponse for RpcResponse {
    fn into_response(self) -> Response {
        let content_type = match self.content_type {
            ContentType::Json => "application/json",
            ContentType::Plaintext => "text/plain",
        };
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, content_type)],
            self.body,
        )
            .into_response()
    }
}

fn obfuscate_pubkey(pk: &UserPubkey) -> String {
    let hex = pk.to_hex();
    format!("{}...{}", &hex[..2], &hex[hex.len() - 3..])
}

fn snodes_to_json(snodes: &[SnodeRecord]) -> Value {
    let entries: Vec<Value> = snodes
        .iter()
        .map(|sn| {
            json!({
                // Deprecated; kept so old clients keep resolving.
                "address": sn.pubkey_legacy.snode_address(),
                "pubkey_legacy": sn.pubkey_legacy.to_hex(),
                "pubkey_x25519": sn.pubkey_x25519.to_hex(),
                "pubkey_ed25519": sn.pubkey_ed25519.to_hex(),
                "port": sn.port_https.to_string(),
                "ip": sn.ip.to_string(),
            })
        })
        .collect();
    json!({ "snodes": entries })
}

// Clients send numeric fields as strings; newer ones send numbers.
fn param_u64(params: &Value, field: &str) -> Option<u64> {
    match params.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Dispatches typed client RPCs (`store`, `retrieve`, ...), reached both
/// directly over HTTPS and as the terminal hop of an onion request.
#[derive(Clone)]
pub struct RequestHandler {
    node: Arc<Node>,
}

impl RequestHandler {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub async fn process_client_req(&self, req_json: &str) -> RpcResponse {
        trace!(len = req_json.len(), "Processing client request");

        let body: Value = match serde_json::from_str(req_json) {
            Ok(body) => body,
            Err(_) => {
                debug!("Bad client request: invalid json");
                return RpcResponse::plain(StatusCode::BAD_REQUEST, "invalid json\n");
            }
        };

        let Some(method) = body.get("method").and_then(Value::as_str) else {
            debug!("Bad client request: no method field");
            return RpcResponse::plain(
                StatusCode::BAD_REQUEST,
                "invalid json: no `method` field\n",
            );
        };

        let Some(params) = body.get("params").filter(|p| p.is_object()) else {
            debug!("Bad client request: no params field");
            return RpcResponse::plain(
                StatusCode::BAD_REQUEST,
                "invalid json: no `params` field\n",
            );
        };

        match method {
            "store" => self.process_store(params),
            "retrieve" => self.process_retrieve(params),
            "get_snodes_for_pubkey" => self.process_snodes_by_pk(params),
            "oxend_request" => self.process_daemon_request(params).await,
            "get_lns_mapping" => match params.get("name_hash").and_then(Value::as_str) {
                Some(name_hash) => self.process_lns_request(name_hash.to_string()).await,
                None => {
                    RpcResponse::plain(StatusCode::BAD_REQUEST, "Field <name_hash> is missing")
                }
            },
            other => {
                debug!(method = other, "Bad client request: unknown method");
                RpcResponse::plain(StatusCode::BAD_REQUEST, format!("no method {other}"))
            }
        }
    }

    fn handle_wrong_swarm(&self, pk: &UserPubkey) -> RpcResponse {
        trace!("Got a client request to a wrong swarm");
        let snodes = self.node.tracker.snapshot().snodes_for_pubkey(pk);
        RpcResponse {
            status: StatusCode::MISDIRECTED_REQUEST,
            body: snodes_to_json(&snodes).to_string(),
            content_type: ContentType::Json,
        }
    }

    fn parse_pubkey(&self, params: &Value) -> Result<UserPubkey, RpcResponse> {
        let raw = params
            .get("pubKey")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RpcResponse::plain(StatusCode::BAD_REQUEST, "invalid json: no `pubKey` field\n")
            })?;
        UserPubkey::from_hex(raw).map_err(|_| {
            debug!("Bad client request: malformed pubkey");
            RpcResponse::plain(
                StatusCode::BAD_REQUEST,
                "Pubkey must be 66 hex characters long\n",
            )
        })
    }

    fn process_store(&self, params: &Value) -> RpcResponse {
        self.node.stats.record_store();

        for field in ["pubKey", "ttl", "timestamp", "data"] {
            if params.get(field).is_none() {
                debug!(field, "Bad client request: missing field");
                return RpcResponse::plain(
                    StatusCode::BAD_REQUEST,
                    format!("invalid json: no `{field}` field\n"),
                );
            }
        }

        let pk = match self.parse_pubkey(params) {
            Ok(pk) => pk,
            Err(res) => return res,
        };

        let Some(data) = params.get("data").and_then(Value::as_str) else {
            return RpcResponse::plain(StatusCode::BAD_REQUEST, "invalid json: bad `data` field\n");
        };
        if data.len() > MAX_MESSAGE_BODY {
            debug!(size = data.len(), "Message body too long");
            return RpcResponse::plain(
                StatusCode::BAD_REQUEST,
                format!("Message body exceeds maximum allowed length of {MAX_MESSAGE_BODY}\n"),
            );
        }

        if !self.node.tracker.snapshot().is_pubkey_for_us(&pk) {
            return self.handle_wrong_swarm(&pk);
        }

        let Some(ttl) = param_u64(params, "ttl") else {
            return RpcResponse::plain(StatusCode::FORBIDDEN, "Provided TTL is not valid.\n");
        };
        if ttl < self.node.config.min_ttl_ms || ttl > self.node.config.max_ttl_ms {
            debug!(ttl, "Rejecting store with out-of-range TTL");
            return RpcResponse::plain(StatusCode::FORBIDDEN, "Provided TTL is not valid.\n");
        }

        let Some(timestamp) = param_u64(params, "timestamp") else {
            return RpcResponse::plain(
                StatusCode::NOT_ACCEPTABLE,
                "Timestamp error: check your clock\n",
            );
        };
        let now = now_ms();
        let skew = self.node.config.max_clock_skew_ms;
        // Not from the future beyond the allowed skew, and not already
        // past its TTL (with the same tolerance).
        if timestamp > now + skew || timestamp + ttl + skew < now {
            debug!(timestamp, "Rejecting store with out-of-window timestamp");
            return RpcResponse::plain(
                StatusCode::NOT_ACCEPTABLE,
                "Timestamp error: check your clock\n",
            );
        }

        let msg = Message::new(pk, data.to_string(), ttl, timestamp);
        let fresh = self.node.store.store(msg);
        trace!(
            recipient = %obfuscate_pubkey(&pk),
            fresh,
            "Successfully stored message"
        );

        // Old clients still expect a proof-of-work difficulty here.
        RpcResponse::ok_json(json!({ "difficulty": 1 }))
    }

    fn process_retrieve(&self, params: &Value) -> RpcResponse {
        self.node.stats.record_retrieve();

        for field in ["pubKey", "lastHash"] {
            if params.get(field).is_none() {
                debug!(field, "Bad client request: missing field");
                return RpcResponse::plain(
                    StatusCode::BAD_REQUEST,
                    format!("invalid json: no `{field}` field\n"),
                );
            }
        }

        let pk = match self.parse_pubkey(params) {
            Ok(pk) => pk,
            Err(res) => return res,
        };

        if !self.node.tracker.snapshot().is_pubkey_for_us(&pk) {
            return self.handle_wrong_swarm(&pk);
        }

        let last_hash = params
            .get("lastHash")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let items = self.node.store.retrieve(&pk, last_hash);
        if !items.is_empty() {
            trace!(
                recipient = %obfuscate_pubkey(&pk),
                count = items.len(),
                "Successfully retrieved messages"
            );
        }

        let messages: Vec<Value> = items
            .iter()
            .map(|m| {
                json!({
                    "hash": m.hash,
                    "expiration": m.expiry_ms(),
                    "data": m.data,
                })
            })
            .collect();

        RpcResponse::ok_json(json!({ "messages": messages }))
    }

    fn process_snodes_by_pk(&self, params: &Value) -> RpcResponse {
        let pk = match self.parse_pubkey(params) {
            Ok(pk) => pk,
            Err(res) => return res,
        };
        let snodes = self.node.tracker.snapshot().snodes_for_pubkey(&pk);
        debug!(count = snodes.len(), "Snodes by pubkey");
        RpcResponse::ok_json(snodes_to_json(&snodes))
    }

    async fn process_daemon_request(&self, params: &Value) -> RpcResponse {
        let Some(endpoint) = params.get("endpoint").and_then(Value::as_str) else {
            return RpcResponse::plain(StatusCode::BAD_REQUEST, "missing 'endpoint'");
        };
        if !ALLOWED_DAEMON_ENDPOINTS.contains(&endpoint) {
            return RpcResponse::plain(
                StatusCode::BAD_REQUEST,
                format!("Endpoint not allowed: {endpoint}"),
            );
        }
        let Some(daemon_params) = params.get("oxend_params").filter(|p| p.is_object()) else {
            return RpcResponse::plain(StatusCode::BAD_REQUEST, "missing 'oxend_params'");
        };

        match self.node.daemon.forward(endpoint, daemon_params.clone()).await {
            Ok(result) => RpcResponse::ok_json(json!({ "result": result })),
            Err(NetError::Daemon(message)) => {
                RpcResponse::ok_json(json!({ "error": { "message": message } }))
            }
            Err(e) => {
                error!(error = %e, endpoint, "Daemon request failed");
                RpcResponse::plain(StatusCode::BAD_REQUEST, "unknown daemon error")
            }
        }
    }

    async fn process_lns_request(&self, name_hash: String) -> RpcResponse {
        match self.node.daemon.lns_names_to_owners(name_hash).await {
            Ok(result) => RpcResponse::ok_json(result),
            Err(e) => {
                debug!(error = %e, "LNS lookup failed");
                RpcResponse::plain(StatusCode::BAD_REQUEST, "unknown daemon error")
            }
        }
    }
}
