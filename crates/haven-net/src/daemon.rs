use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use haven_shared::types::{BlockUpdate, SnodeRecord, SwarmInfo};
use haven_shared::{Ed25519Pubkey, LegacyPubkey, X25519Pubkey};

use crate::error::NetError;

const DAEMON_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC client for the local blockchain daemon.
pub struct DaemonClient {
    http: reqwest::Client,
    rpc_url: String,
}

impl DaemonClient {
    pub fn new(rpc_url: String) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .timeout(DAEMON_RPC_TIMEOUT)
            .build()?;
        Ok(Self { http, rpc_url })
    }

    async fn json_rpc(&self, method: &str, params: Value) -> Result<Value, NetError> {
        let req = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });
        let resp: Value = self
            .http
            .post(format!("{}/json_rpc", self.rpc_url))
            .json(&req)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.get("error") {
            return Err(NetError::Daemon(err.to_string()));
        }
        resp.get("result")
            .cloned()
            .ok_or_else(|| NetError::Daemon("response carries no result".into()))
    }

    /// Forward a whitelisted RPC call; the allow-list is the caller's job.
    pub async fn forward(&self, endpoint: &str, params: Value) -> Result<Value, NetError> {
        self.json_rpc(endpoint, params).await
    }

    pub async fn lns_names_to_owners(&self, name_hash: String) -> Result<Value, NetError> {
        let params = json!({
            "entries": [{ "name_hash": name_hash, "types": [0] }],
        });
        self.json_rpc("lns_names_to_owners", params).await
    }

    /// The node's three private keys, as registered on chain. The Ed25519
    /// value may arrive as a 64-byte expanded key; only the seed is used.
    pub async fn get_service_node_privkey(
        &self,
    ) -> Result<([u8; 32], [u8; 32], [u8; 32]), NetError> {
        let result = self
            .json_rpc("get_service_node_privkey", json!({}))
            .await?;
        let field = |name: &str| -> Result<[u8; 32], NetError> {
            let hex_str = result
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| NetError::Daemon(format!("missing {name}")))?;
            let bytes = hex::decode(hex_str)
                .map_err(|e| NetError::Daemon(format!("bad {name}: {e}")))?;
            bytes
                .get(..32)
                .and_then(|b| <[u8; 32]>::try_from(b).ok())
                .ok_or_else(|| NetError::Daemon(format!("{name} is too short")))
        };
        Ok((
            field("service_node_privkey")?,
            field("service_node_ed25519_privkey")?,
            field("service_node_x25519_privkey")?,
        ))
    }

    /// The authoritative swarm roster at the daemon's current tip.
    pub async fn get_service_nodes(&self) -> Result<BlockUpdate, NetError> {
        let params = json!({
            "fields": {
                "service_node_pubkey": true,
                "pubkey_ed25519": true,
                "pubkey_x25519": true,
                "public_ip": true,
                "storage_port": true,
                "storage_lmq_port": true,
                "swarm_id": true,
                "funded": true,
                "active": true,
                "block_hash": true,
                "height": true,
                "hardfork": true,
            },
        });
        let result = self.json_rpc("get_n_service_nodes", params).await?;
        parse_block_update(&result)
    }
}

fn parse_block_update(result: &Value) -> Result<BlockUpdate, NetError> {
    let states = result
        .get("service_node_states")
        .and_then(Value::as_array)
        .ok_or_else(|| NetError::Daemon("missing service_node_states".into()))?;

    let mut swarms: BTreeMap<u64, Vec<SnodeRecord>> = BTreeMap::new();
    let mut decommissioned = Vec::new();

    for state in states {
        if !state.get("funded").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let Some(record) = parse_snode(state) else {
            warn!("Skipping service node entry with unparseable keys");
            continue;
        };
        if state.get("active").and_then(Value::as_bool).unwrap_or(false) {
            let swarm_id = state
                .get("swarm_id")
                .and_then(Value::as_u64)
                .unwrap_or(haven_shared::INVALID_SWARM_ID);
            swarms.entry(swarm_id).or_default().push(record);
        } else {
            decommissioned.push(record);
        }
    }

    let update = BlockUpdate {
        height: result.get("height").and_then(Value::as_u64).unwrap_or(0),
        block_hash: result
            .get("block_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        hardfork: result.get("hardfork").and_then(Value::as_u64).unwrap_or(0) as u8,
        swarms: swarms
            .into_iter()
            .map(|(swarm_id, snodes)| SwarmInfo { swarm_id, snodes })
            .collect(),
        decommissioned,
    };
    debug!(
        height = update.height,
        swarms = update.swarms.len(),
        "Parsed block update from daemon"
    );
    Ok(update)
}

fn parse_snode(state: &Value) -> Option<SnodeRecord> {
    let legacy = state.get("service_node_pubkey")?.as_str()?;
    let ed25519 = state.get("pubkey_ed25519").and_then(Value::as_str);
    let x25519 = state.get("pubkey_x25519").and_then(Value::as_str);

    Some(SnodeRecord {
        ip: state
            .get("public_ip")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED),
        port_https: state
            .get("storage_port")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u16,
        port_mq: state
            .get("storage_lmq_port")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u16,
        pubkey_legacy: LegacyPubkey::from_hex(legacy).ok()?,
        pubkey_ed25519: ed25519
            .and_then(|s| Ed25519Pubkey::from_hex(s).ok())
            .unwrap_or(Ed25519Pubkey([0; 32])),
        pubkey_x25519: x25519
            .and_then(|s| X25519Pubkey::from_hex(s).ok())
            .unwrap_or(X25519Pubkey([0; 32])),
    })
}
