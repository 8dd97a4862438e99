use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use haven_shared::constants::{SNODE_SENDER_HEADER, SNODE_SIGNATURE_HEADER};
use haven_shared::types::{Message, SnodeRecord};
use haven_shared::{ChannelCipher, Identity};

use crate::error::NetError;
use crate::mq::{
    open, read_frame, seal, write_frame, MqEnvelope, MqReply, MqRequest, OnionControl,
    CMD_DATA, CMD_ONION_REQ,
};

/// Default deadline for any outbound peer request.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound requests to other service nodes, over HTTPS and over the
/// message queue. Every HTTPS request carries the sender pubkey and an
/// Ed25519 signature over the body; MQ requests are channel-encrypted.
pub struct PeerClient {
    http: reqwest::Client,
    identity: Arc<Identity>,
    cipher: Arc<ChannelCipher>,
}

impl PeerClient {
    pub fn new(identity: Arc<Identity>, cipher: Arc<ChannelCipher>) -> Result<Self, NetError> {
        // Snode certificates are self-signed; peers are authenticated by
        // the signature headers and the signed-cert response header, not
        // by a CA chain.
        let http = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http,
            identity,
            cipher,
        })
    }

    fn peer_url(&self, node: &SnodeRecord, path: &str) -> String {
        format!("https://{}:{}{}", node.ip, node.port_https, path)
    }

    async fn signed_post(
        &self,
        node: &SnodeRecord,
        path: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, NetError> {
        let signature = self.identity.sign_request(&body);
        let resp = self
            .http
            .post(self.peer_url(node, path))
            .header(SNODE_SENDER_HEADER, self.identity.legacy_pubkey().to_base32z())
            .header(SNODE_SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;
        Ok(resp)
    }

    /// Liveness probe; any 2xx counts as reachable.
    pub async fn ping(&self, node: &SnodeRecord) -> Result<(), NetError> {
        let resp = self.signed_post(node, "/swarms/ping_test/v1", Vec::new()).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NetError::BadResponse(format!(
                "ping answered {}",
                resp.status()
            )))
        }
    }

    /// Ask `node` to prove it stores the message behind `msg_hash`.
    pub async fn storage_test(
        &self,
        node: &SnodeRecord,
        height: u64,
        msg_hash: &str,
    ) -> Result<Value, NetError> {
        let body = json!({ "height": height, "hash": msg_hash }).to_string();
        let resp = self
            .signed_post(node, "/swarms/storage_test/v1", body.into_bytes())
            .await?;
        if !resp.status().is_success() {
            return Err(NetError::BadResponse(format!(
                "storage test answered {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// POST an onion payload to an external server (the `/lsrpc` exit
    /// path); the upstream body passes through untouched.
    pub async fn relay_to_server(
        &self,
        protocol: &str,
        host: &str,
        port: u16,
        target: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetError> {
        let url = format!("{protocol}://{host}:{port}{target}");
        debug!(url = %url, "Relaying onion request to external server");
        let resp = self.http.post(url).body(payload).send().await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn mq_request(
        &self,
        node: &SnodeRecord,
        request: &MqRequest,
    ) -> Result<MqReply, NetError> {
        let addr = (node.ip, node.port_mq);
        let reply = timeout(PEER_TIMEOUT, async {
            let mut stream = TcpStream::connect(addr).await?;
            let envelope = seal(&self.cipher, &node.pubkey_x25519, request)?;
            write_frame(&mut stream, &bincode::serialize(&envelope)?).await?;

            let frame = read_frame(&mut stream).await?;
            let envelope: MqEnvelope = bincode::deserialize(&frame)?;
            open::<MqReply>(&self.cipher, &envelope)
        })
        .await
        .map_err(|_| {
            warn!(peer = %node.pubkey_legacy, "MQ request timed out");
            NetError::Timeout
        })??;
        Ok(reply)
    }

    /// Hand a batch of messages to a swarm peer.
    pub async fn push_data(
        &self,
        node: &SnodeRecord,
        batch: &[Message],
    ) -> Result<(), NetError> {
        let request = MqRequest {
            command: CMD_DATA.into(),
            parts: vec![bincode::serialize(batch)?],
        };
        debug!(peer = %node.pubkey_legacy, count = batch.len(), "Pushing message batch");
        self.mq_request(node, &request).await?;
        Ok(())
    }

    /// Forward an onion layer to the next hop; the reply is the upstream
    /// `[status, body]` pair, already encrypted for hops above us.
    pub async fn send_onion_req(
        &self,
        node: &SnodeRecord,
        control: &OnionControl,
        ciphertext: Vec<u8>,
    ) -> Result<(u16, Vec<u8>), NetError> {
        let request = MqRequest {
            command: CMD_ONION_REQ.into(),
            parts: vec![control.encode(), ciphertext],
        };
        let reply = self.mq_request(node, &request).await?;

        if reply.parts.len() < 2 {
            return Err(NetError::BadResponse(format!(
                "expected at least 2 reply parts, got {}",
                reply.parts.len()
            )));
        }
        let status = std::str::from_utf8(&reply.parts[0])
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| NetError::BadResponse("unparseable status part".into()))?;
        Ok((status, reply.parts[1].clone()))
    }
}
