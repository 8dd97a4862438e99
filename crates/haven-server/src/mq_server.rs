use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use haven_net::mq::{
    open, read_frame, seal, write_frame, MqEnvelope, MqReply, MqRequest, OnionControl,
    CMD_DATA, CMD_ONION_REQ,
};
use haven_shared::types::SnodeRecord;

use crate::node::{now_ms, Node};
use crate::onion::{OnionMeta, OnionProcessor};
use crate::rate_limit::RateLimiter;

/// Inbound connections are closed this long after accept.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(60);

pub async fn serve(node: Arc<Node>, limiter: Arc<RateLimiter>) -> anyhow::Result<()> {
    let port = node.config.mq_port;
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!(port, "Message queue listening");
    serve_on(node, limiter, listener).await
}

pub async fn serve_on(
    node: Arc<Node>,
    limiter: Arc<RateLimiter>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let node = node.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            if timeout(CONNECTION_DEADLINE, handle_connection(node, limiter, stream))
                .await
                .is_err()
            {
                debug!(peer = %addr, "MQ connection deadline reached");
            }
        });
    }
}

async fn handle_connection(node: Arc<Node>, limiter: Arc<RateLimiter>, mut stream: TcpStream) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return, // peer closed or misbehaved
        };
        let envelope: MqEnvelope = match bincode::deserialize(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Dropping MQ connection with malformed envelope");
                return;
            }
        };

        // The transport identity is the x25519 key; only currently-known
        // snodes get to talk to us here.
        let sender = {
            let snapshot = node.tracker.snapshot();
            match snapshot.find_node_by_x25519(&envelope.sender_x25519) {
                Some(sn) => sn.clone(),
                None => {
                    warn!(sender = %envelope.sender_x25519, "MQ message from unknown node");
                    return;
                }
            }
        };

        let request: MqRequest = match open(&node.cipher, &envelope) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %sender.pubkey_legacy, error = %e, "Undecryptable MQ request");
                return;
            }
        };

        let reply = if limiter.should_rate_limit_peer(sender.pubkey_legacy) {
            MqReply {
                parts: vec![b"429".to_vec(), b"too many requests from this snode".to_vec()],
            }
        } else {
            dispatch(&node, &sender, request).await
        };

        let envelope = match seal(&node.cipher, &sender.pubkey_x25519, &reply) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to encrypt MQ reply");
                return;
            }
        };
        let Ok(bytes) = bincode::serialize(&envelope) else {
            return;
        };
        if write_frame(&mut stream, &bytes).await.is_err() {
            return;
        }
    }
}

async fn dispatch(node: &Arc<Node>, sender: &SnodeRecord, request: MqRequest) -> MqReply {
    match request.command.as_str() {
        CMD_DATA => {
            debug!(peer = %sender.pubkey_legacy, "MQ: sn.data");
            node.stats.record_ping_mq(now_ms());
            if request.parts.len() != 1 {
                return error_reply(400, "expected 1 message part");
            }
            node.process_push_batch(&request.parts[0]);
            // Empty ack; senders only care that the batch landed.
            MqReply { parts: vec![] }
        }
        CMD_ONION_REQ => {
            debug!(peer = %sender.pubkey_legacy, "MQ: sn.onion_req");
            if request.parts.len() != 2 {
                return error_reply(400, "Incorrect number of messages");
            }
            let control = match OnionControl::decode(&request.parts[0]) {
                Ok(control) => control,
                Err(e) => return error_reply(400, &e.to_string()),
            };
            let processor = OnionProcessor::new(node.clone());
            let meta = OnionMeta {
                ephem_key: control.ephemeral_key,
                enc_type: control.enc_type,
                hop_no: control.hop_no,
            };
            let res = processor.process_onion_req(&request.parts[1], meta).await;
            MqReply {
                parts: vec![
                    res.status.as_u16().to_string().into_bytes(),
                    res.body.into_bytes(),
                ],
            }
        }
        other => {
            debug!(command = other, "Unknown MQ command");
            error_reply(400, &format!("unknown command {other}"))
        }
    }
}

fn error_reply(status: u16, message: &str) -> MqReply {
    MqReply {
        parts: vec![
            status.to_string().into_bytes(),
            message.as_bytes().to_vec(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use base64::{engine::general_purpose::STANDARD as b64, Engine};
    use rand::rngs::OsRng;
    use serde_json::{json, Value};
    use x25519_dalek::StaticSecret;

    use haven_net::PeerClient;
    use haven_shared::types::{BlockUpdate, Message, SwarmInfo};
    use haven_shared::{
        emit_combined_payload, ChannelCipher, EncryptType, Identity, UserPubkey,
    };

    use crate::config::Config;
    use crate::node::now_ms;

    fn snode_record(identity: &Identity, ip: Ipv4Addr, port_mq: u16) -> SnodeRecord {
        SnodeRecord {
            ip,
            port_https: 443,
            port_mq,
            pubkey_legacy: identity.legacy_pubkey(),
            pubkey_ed25519: identity.ed25519_pubkey(),
            pubkey_x25519: identity.x25519_pubkey(),
        }
    }

    /// Boots a server node with `peer` in its roster and returns the
    /// record to dial it with.
    async fn boot(peer: &Identity) -> (Arc<Node>, SnodeRecord) {
        let node = Arc::new(Node::new(Config::default(), Identity::generate()).unwrap());
        node.tracker.apply_block_update(BlockUpdate {
            swarms: vec![SwarmInfo {
                swarm_id: 0,
                snodes: vec![
                    snode_record(&node.identity, Ipv4Addr::new(10, 0, 0, 1), 1),
                    snode_record(peer, Ipv4Addr::new(10, 0, 0, 2), 2),
                ],
            }],
            ..Default::default()
        });

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let limiter = Arc::new(RateLimiter::new(&node.config));
        tokio::spawn(serve_on(node.clone(), limiter, listener));

        let dial = snode_record(&node.identity, Ipv4Addr::LOCALHOST, addr.port());
        (node, dial)
    }

    fn peer_client(peer: &Identity) -> PeerClient {
        let identity = Arc::new(peer.clone());
        let cipher = Arc::new(ChannelCipher::new(peer.x25519_secret().clone(), false));
        PeerClient::new(identity, cipher).unwrap()
    }

    #[tokio::test]
    async fn test_push_batch_over_mq() {
        let peer = Identity::generate();
        let (node, dial) = boot(&peer).await;

        let pk = UserPubkey::from_hex(&format!("05{}", "ab".repeat(32))).unwrap();
        let batch = vec![Message::new(pk, "aGk=".into(), 60_000, now_ms())];
        peer_client(&peer).push_data(&dial, &batch).await.unwrap();

        assert_eq!(node.store.len(), 1);
    }

    #[tokio::test]
    async fn test_onion_req_over_mq_matches_https_semantics() {
        let peer = Identity::generate();
        let (node, dial) = boot(&peer).await;

        let client = ChannelCipher::new(StaticSecret::random_from_rng(OsRng), false);
        let rpc = json!({
            "method": "retrieve",
            "params": { "pubKey": format!("05{}", "ab".repeat(32)), "lastHash": "" },
        })
        .to_string();
        let inner = emit_combined_payload(rpc.as_bytes(), &json!({ "headers": "" }));
        let layer = client
            .encrypt(EncryptType::AesGcm, &inner, &node.identity.x25519_pubkey())
            .unwrap();

        let control = OnionControl {
            ephemeral_key: client.public_key(),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let (status, body) = peer_client(&peer)
            .send_onion_req(&dial, &control, layer)
            .await
            .unwrap();

        assert_eq!(status, 200);
        let plain = client
            .decrypt(
                EncryptType::AesGcm,
                &b64.decode(body).unwrap(),
                &node.identity.x25519_pubkey(),
            )
            .unwrap();
        let reply: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(reply["status"], 200);
    }

    #[tokio::test]
    async fn test_unknown_sender_is_dropped() {
        let peer = Identity::generate();
        let (_node, dial) = boot(&peer).await;

        // A signer the roster has never seen.
        let outsider = Identity::generate();
        let result = peer_client(&outsider)
            .push_data(&dial, &[])
            .await;
        assert!(result.is_err());
    }
}
