use std::sync::Arc;

use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD as b64, Engine};
use serde_json::{json, Value};
use tracing::{debug, warn};

use haven_net::mq::OnionControl;
use haven_net::NetError;
use haven_shared::{parse_combined_payload, Ed25519Pubkey, EncryptType, X25519Pubkey};

use crate::handler::{RequestHandler, RpcResponse};
use crate::node::Node;

/// Metadata for the layer we peeled; the reply must be encrypted under the
/// same ephemeral key and scheme the client used for this layer.
#[derive(Debug, Clone)]
pub struct OnionMeta {
    pub ephem_key: X25519Pubkey,
    pub enc_type: EncryptType,
    pub hop_no: u32,
}

/// What one decrypted onion layer asks us to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRequest {
    /// We are the terminal hop; the inner ciphertext is a client RPC.
    FinalDestination {
        body: Vec<u8>,
        json: bool,
        base64: bool,
    },
    /// Forward the whole decrypted payload to an external HTTPS endpoint.
    RelayToServer {
        payload: Vec<u8>,
        host: String,
        port: u16,
        protocol: String,
        target: String,
    },
    /// Forward the inner ciphertext to another snode.
    RelayToNode {
        ciphertext: Vec<u8>,
        ephemeral_key: X25519Pubkey,
        enc_type: EncryptType,
        next_node: Ed25519Pubkey,
    },
    /// The layer decrypted but its JSON does not classify.
    Invalid,
}

/// External relay targets must look like an lsrpc endpoint and carry no
/// query string.
pub fn is_server_url_allowed(url: &str) -> bool {
    (url.starts_with("/loki/") || url.starts_with("/oxen/"))
        && url.ends_with("/lsrpc")
        && !url.contains('?')
}

/// Classify a decrypted layer. Presence of `headers` (with any value)
/// marks the terminal hop; `host` an external relay; otherwise a snode
/// relay keyed by `destination`.
pub fn process_inner_request(plaintext: &[u8]) -> ParsedRequest {
    let (ciphertext, inner_json) = match parse_combined_payload(plaintext) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Error parsing inner onion payload");
            return ParsedRequest::Invalid;
        }
    };

    if inner_json.get("headers").is_some() {
        return ParsedRequest::FinalDestination {
            body: ciphertext,
            json: inner_json.get("json").and_then(Value::as_bool).unwrap_or(false),
            base64: inner_json
                .get("base64")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };
    }

    if let Some(host) = inner_json.get("host").and_then(Value::as_str) {
        let Some(target) = inner_json.get("target").and_then(Value::as_str) else {
            return ParsedRequest::Invalid;
        };
        return ParsedRequest::RelayToServer {
            payload: plaintext.to_vec(),
            host: host.to_string(),
            port: inner_json
                .get("port")
                .and_then(Value::as_u64)
                .map(|p| p as u16)
                .unwrap_or(443),
            protocol: inner_json
                .get("protocol")
                .and_then(Value::as_str)
                .unwrap_or("https")
                .to_string(),
            target: target.to_string(),
        };
    }

    let next_node = inner_json
        .get("destination")
        .and_then(Value::as_str)
        .and_then(|s| Ed25519Pubkey::from_hex(s).ok());
    let ephemeral_key = inner_json
        .get("ephemeral_key")
        .and_then(Value::as_str)
        .and_then(|s| X25519Pubkey::from_hex(s).ok());
    let enc_type = match inner_json.get("enc_type").and_then(Value::as_str) {
        Some(s) => match EncryptType::parse(s) {
            Ok(t) => t,
            Err(_) => return ParsedRequest::Invalid,
        },
        None => EncryptType::AesGcm,
    };

    match (next_node, ephemeral_key) {
        (Some(next_node), Some(ephemeral_key)) => ParsedRequest::RelayToNode {
            ciphertext,
            ephemeral_key,
            enc_type,
            next_node,
        },
        _ => ParsedRequest::Invalid,
    }
}

/// Peels one onion layer and dispatches it: terminal hops run the client
/// RPC locally, relays forward to the next snode or an external server.
#[derive(Clone)]
pub struct OnionProcessor {
    node: Arc<Node>,
    handler: RequestHandler,
}

impl OnionProcessor {
    pub fn new(node: Arc<Node>) -> Self {
        let handler = RequestHandler::new(node.clone());
        Self { node, handler }
    }

    pub async fn process_onion_req(&self, ciphertext: &[u8], meta: OnionMeta) -> RpcResponse {
        if let Err(reason) = self.node.snode_ready() {
            return RpcResponse::plain(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Snode not ready: {reason}"),
            );
        }

        self.node.stats.record_onion_request();

        let plaintext = match self
            .node
            .cipher
            .decrypt(meta.enc_type, ciphertext, &meta.ephem_key)
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(
                    len = ciphertext.len(),
                    enc_type = %meta.enc_type,
                    error = %e,
                    "Error decrypting onion request"
                );
                return RpcResponse::plain(StatusCode::BAD_REQUEST, "Invalid ciphertext");
            }
        };

        match process_inner_request(&plaintext) {
            ParsedRequest::FinalDestination { body, json, .. } => {
                debug!(hop = meta.hop_no, "We are the final destination of an onion request");
                let response = match std::str::from_utf8(&body) {
                    Ok(request) => self.handler.process_client_req(request).await,
                    Err(_) => {
                        RpcResponse::plain(StatusCode::BAD_REQUEST, "Invalid json")
                    }
                };
                self.wrap_response(response, &meta, json)
            }
            ParsedRequest::RelayToNode {
                ciphertext,
                ephemeral_key,
                enc_type,
                next_node,
            } => {
                self.relay_to_node(ciphertext, ephemeral_key, enc_type, next_node, &meta)
                    .await
            }
            ParsedRequest::RelayToServer {
                payload,
                host,
                port,
                protocol,
                target,
            } => {
                if !is_server_url_allowed(&target) {
                    return self.wrap_response(
                        RpcResponse::plain(StatusCode::BAD_REQUEST, "Invalid url"),
                        &meta,
                        false,
                    );
                }
                debug!(host = %host, target = %target, "Forwarding onion request to server");
                match self
                    .node
                    .peers
                    .relay_to_server(&protocol, &host, port, &target, payload)
                    .await
                {
                    Ok(body) => RpcResponse::ok_json_raw(body),
                    Err(e) => {
                        debug!(error = %e, "External relay failed");
                        RpcResponse::plain(StatusCode::BAD_REQUEST, "Upstream server error")
                    }
                }
            }
            ParsedRequest::Invalid => self.wrap_response(
                RpcResponse::plain(StatusCode::BAD_REQUEST, "Invalid json"),
                &meta,
                false,
            ),
        }
    }

    async fn relay_to_node(
        &self,
        ciphertext: Vec<u8>,
        ephemeral_key: X25519Pubkey,
        enc_type: EncryptType,
        next_node: Ed25519Pubkey,
        meta: &OnionMeta,
    ) -> RpcResponse {
        let snapshot = self.node.tracker.snapshot();
        let Some(dest) = snapshot.find_node_by_ed25519(&next_node).cloned() else {
            warn!(dest = %next_node, "Next onion hop not found");
            return RpcResponse::plain(
                StatusCode::BAD_GATEWAY,
                format!("Next node not found: {next_node}"),
            );
        };

        debug!(dest = %dest.pubkey_legacy, hop = meta.hop_no, "Relaying onion request");
        let control = OnionControl {
            ephemeral_key,
            enc_type,
            hop_no: meta.hop_no + 1,
        };
        match self
            .node
            .peers
            .send_onion_req(&dest, &control, ciphertext)
            .await
        {
            // The upstream reply is already encrypted for the layers above
            // us; it passes through untouched.
            Ok((status, body)) => RpcResponse {
                status: StatusCode::from_u16(status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                body: String::from_utf8_lossy(&body).into_owned(),
                content_type: crate::handler::ContentType::Json,
            },
            Err(NetError::Timeout) => {
                debug!("Onion relay timed out");
                RpcResponse::plain(StatusCode::GATEWAY_TIMEOUT, "Request time out")
            }
            Err(e) => {
                debug!(error = %e, "Onion relay failed");
                RpcResponse::plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Invalid response from snode",
                )
            }
        }
    }

    /// Encrypt a response under the incoming layer's ephemeral key and
    /// scheme, preserving onion symmetry even for errors.
    fn wrap_response(&self, res: RpcResponse, meta: &OnionMeta, as_json: bool) -> RpcResponse {
        let body_value = if as_json {
            serde_json::from_str(&res.body).unwrap_or(Value::String(res.body.clone()))
        } else {
            Value::String(res.body.clone())
        };
        let payload = json!({
            "status": res.status.as_u16(),
            "body": body_value,
        })
        .to_string();

        match self
            .node
            .cipher
            .encrypt(meta.enc_type, payload.as_bytes(), &meta.ephem_key)
        {
            Ok(ciphertext) => RpcResponse {
                status: StatusCode::OK,
                body: b64.encode(ciphertext),
                content_type: crate::handler::ContentType::Json,
            },
            Err(e) => {
                warn!(error = %e, "Failed to encrypt onion response");
                RpcResponse::plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encrypt response",
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use haven_shared::types::{BlockUpdate, SnodeRecord, SwarmInfo};
    use haven_shared::{emit_combined_payload, ChannelCipher, Identity};
    use rand::rngs::OsRng;
    use x25519_dalek::StaticSecret;

    use crate::config::Config;
    use crate::node::now_ms;

    const PLAINTEXT: &[u8] = b"plaintext";
    const CIPHERTEXT: &[u8] = b"ciphertext";

    fn combined(json: Value) -> Vec<u8> {
        emit_combined_payload(CIPHERTEXT, &json)
    }

    // Provided "headers", so the request terminates at this node.
    #[test]
    fn test_final_destination() {
        let res = process_inner_request(&combined(json!({ "headers": "something" })));
        assert_eq!(
            res,
            ParsedRequest::FinalDestination {
                body: CIPHERTEXT.to_vec(),
                json: false,
                base64: true,
            }
        );
    }

    // Provided "host": relay to an external server, defaulted port and
    // protocol.
    #[test]
    fn test_relay_to_server_defaults() {
        let payload = combined(json!({ "host": "example.com", "target": "/loki/v3/lsrpc" }));
        let res = process_inner_request(&payload);
        assert_eq!(
            res,
            ParsedRequest::RelayToServer {
                payload,
                host: "example.com".into(),
                port: 443,
                protocol: "https".into(),
                target: "/loki/v3/lsrpc".into(),
            }
        );
    }

    #[test]
    fn test_relay_to_server_explicit() {
        let payload = combined(json!({
            "host": "host",
            "target": "target",
            "port": 80,
            "protocol": "http",
        }));
        let res = process_inner_request(&payload);
        assert_eq!(
            res,
            ParsedRequest::RelayToServer {
                payload,
                host: "host".into(),
                port: 80,
                protocol: "http".into(),
                target: "target".into(),
            }
        );
    }

    // No "host" or "headers": forward to another snode.
    #[test]
    fn test_relay_to_node() {
        let dest = "ffffeeeeddddccccbbbbaaaa9999888877776666555544443333222211110000";
        let res = process_inner_request(&combined(json!({
            "destination": dest,
            "ephemeral_key": "ee".repeat(32),
        })));
        assert_eq!(
            res,
            ParsedRequest::RelayToNode {
                ciphertext: CIPHERTEXT.to_vec(),
                ephemeral_key: X25519Pubkey([0xee; 32]),
                enc_type: EncryptType::AesGcm,
                next_node: Ed25519Pubkey::from_hex(dest).unwrap(),
            }
        );
    }

    #[test]
    fn test_classification_failures() {
        assert_eq!(process_inner_request(PLAINTEXT), ParsedRequest::Invalid);
        // destination without an ephemeral key cannot be relayed.
        assert_eq!(
            process_inner_request(&combined(json!({ "destination": "ff".repeat(32) }))),
            ParsedRequest::Invalid
        );
        // host without a target is underspecified.
        assert_eq!(
            process_inner_request(&combined(json!({ "host": "example.com" }))),
            ParsedRequest::Invalid
        );
    }

    #[test]
    fn test_url_filter() {
        assert!(is_server_url_allowed("/loki/v3/lsrpc"));
        assert!(is_server_url_allowed("/loki/oxen/v4/lsrpc"));
        assert!(is_server_url_allowed("/oxen/v3/lsrpc"));

        assert!(!is_server_url_allowed("/not_loki/v3/lsrpc"));
        assert!(!is_server_url_allowed("/loki/v3"));
        assert!(!is_server_url_allowed("/loki/v3/lsrpc?foo=bar"));
    }

    fn ready_node() -> Arc<Node> {
        let node = Arc::new(Node::new(Config::default(), Identity::generate()).unwrap());
        let us = SnodeRecord {
            ip: Ipv4Addr::new(10, 0, 0, 1),
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
        node
    }

    // Full terminal round trip: encrypt a layer to the node, process it,
    // and recover the reply with the same ephemeral key and scheme.
    #[tokio::test]
    async fn test_terminal_hop_roundtrip() {
        let node = ready_node();
        let processor = OnionProcessor::new(node.clone());

        let client = ChannelCipher::new(StaticSecret::random_from_rng(OsRng), false);
        let rpc = json!({
            "method": "store",
            "params": {
                "pubKey": format!("05{}1", "0".repeat(63)),
                "ttl": "60000",
                "timestamp": now_ms().to_string(),
                "data": "aGVsbG8=",
            },
        })
        .to_string();
        let inner = emit_combined_payload(rpc.as_bytes(), &json!({ "headers": "" }));
        let layer = client
            .encrypt(EncryptType::XChaCha20, &inner, &node.identity.x25519_pubkey())
            .unwrap();

        let meta = OnionMeta {
            ephem_key: client.public_key(),
            enc_type: EncryptType::XChaCha20,
            hop_no: 0,
        };
        let res = processor.process_onion_req(&layer, meta).await;
        assert_eq!(res.status, StatusCode::OK);

        let ciphertext = b64.decode(res.body).unwrap();
        let plain = client
            .decrypt(EncryptType::XChaCha20, &ciphertext, &node.identity.x25519_pubkey())
            .unwrap();
        let reply: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(reply["status"], 200);
        assert_eq!(reply["body"], json!({ "difficulty": 1 }).to_string());
        assert_eq!(node.store.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_ciphertext_is_plain_400() {
        let node = ready_node();
        let processor = OnionProcessor::new(node.clone());
        let meta = OnionMeta {
            ephem_key: X25519Pubkey([0x11; 32]),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let res = processor.process_onion_req(b"garbage", meta).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body, "Invalid ciphertext");
    }

    #[tokio::test]
    async fn test_invalid_inner_json_is_wrapped() {
        let node = ready_node();
        let processor = OnionProcessor::new(node.clone());

        let client = ChannelCipher::new(StaticSecret::random_from_rng(OsRng), false);
        let layer = client
            .encrypt(
                EncryptType::AesGcm,
                b"definitely not a combined payload",
                &node.identity.x25519_pubkey(),
            )
            .unwrap();
        let meta = OnionMeta {
            ephem_key: client.public_key(),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let res = processor.process_onion_req(&layer, meta).await;
        // The error is encrypted under the incoming layer key.
        assert_eq!(res.status, StatusCode::OK);
        let plain = client
            .decrypt(
                EncryptType::AesGcm,
                &b64.decode(res.body).unwrap(),
                &node.identity.x25519_pubkey(),
            )
            .unwrap();
        let reply: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(reply["status"], 400);
        assert_eq!(reply["body"], "Invalid json");
    }

    #[tokio::test]
    async fn test_unknown_next_node_is_502() {
        let node = ready_node();
        let processor = OnionProcessor::new(node.clone());

        let client = ChannelCipher::new(StaticSecret::random_from_rng(OsRng), false);
        let inner = emit_combined_payload(
            CIPHERTEXT,
            &json!({
                "destination": "ab".repeat(32),
                "ephemeral_key": "ee".repeat(32),
            }),
        );
        let layer = client
            .encrypt(EncryptType::AesGcm, &inner, &node.identity.x25519_pubkey())
            .unwrap();
        let meta = OnionMeta {
            ephem_key: client.public_key(),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let res = processor.process_onion_req(&layer, meta).await;
        assert_eq!(res.status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_not_ready_is_503() {
        let node = Arc::new(Node::new(Config::default(), Identity::generate()).unwrap());
        let processor = OnionProcessor::new(node);
        let meta = OnionMeta {
            ephem_key: X25519Pubkey([0x11; 32]),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let res = processor.process_onion_req(b"x", meta).await;
        assert_eq!(res.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_disallowed_server_target_is_wrapped_400() {
        let node = ready_node();
        let processor = OnionProcessor::new(node.clone());

        let client = ChannelCipher::new(StaticSecret::random_from_rng(OsRng), false);
        let inner = emit_combined_payload(
            CIPHERTEXT,
            &json!({ "host": "example.com", "target": "/loki/v3/lsrpc?foo=bar" }),
        );
        let layer = client
            .encrypt(EncryptType::AesGcm, &inner, &node.identity.x25519_pubkey())
            .unwrap();
        let meta = OnionMeta {
            ephem_key: client.public_key(),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let res = processor.process_onion_req(&layer, meta).await;
        assert_eq!(res.status, StatusCode::OK);
        let plain = client
            .decrypt(
                EncryptType::AesGcm,
                &b64.decode(res.body).unwrap(),
                &node.identity.x25519_pubkey(),
            )
            .unwrap();
        let reply: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(reply["status"], 400);
        assert_eq!(reply["body"], "Invalid url");
    }
}
