use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::keys::{Ed25519Pubkey, LegacyPubkey, UserPubkey, X25519Pubkey};

pub use crate::constants::INVALID_SWARM_ID;

/// One service node as published by the blockchain daemon.
///
/// Identity is the legacy pubkey alone; the daemon sometimes publishes
/// records with a default ip/ports while a node is mid-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnodeRecord {
    pub ip: Ipv4Addr,
    pub port_https: u16,
    pub port_mq: u16,
    pub pubkey_legacy: LegacyPubkey,
    pub pubkey_ed25519: Ed25519Pubkey,
    pub pubkey_x25519: X25519Pubkey,
}

impl SnodeRecord {
    pub fn has_default_ip(&self) -> bool {
        self.ip == Ipv4Addr::UNSPECIFIED
    }

    /// True when the daemon has not yet published usable contact data.
    pub fn is_incomplete(&self) -> bool {
        self.has_default_ip()
            || self.port_https == 0
            || self.port_mq == 0
            || self.pubkey_ed25519.is_default()
            || self.pubkey_x25519.is_default()
    }
}

impl PartialEq for SnodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey_legacy == other.pubkey_legacy
    }
}

impl Eq for SnodeRecord {}

impl std::hash::Hash for SnodeRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pubkey_legacy.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmInfo {
    pub swarm_id: u64,
    pub snodes: Vec<SnodeRecord>,
}

/// Authoritative network state for one block, as fetched from the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub height: u64,
    pub block_hash: String,
    pub hardfork: u8,
    pub swarms: Vec<SwarmInfo>,
    pub decommissioned: Vec<SnodeRecord>,
}

/// Count of snodes still missing contact data, over the total. A high
/// missing ratio means the daemon is still syncing.
pub fn count_missing_data(bu: &BlockUpdate) -> (usize, usize) {
    let mut missing = 0;
    let mut total = 0;
    for swarm in &bu.swarms {
        for snode in &swarm.snodes {
            total += 1;
            if snode.is_incomplete() {
                missing += 1;
            }
        }
    }
    (missing, total)
}

/// A client message awaiting pickup. `data` is kept in its wire (base64)
/// form; the hash binds every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub recipient: UserPubkey,
    pub data: String,
    pub hash: String,
    pub ttl_ms: u64,
    pub timestamp_ms: u64,
}

impl Message {
    pub fn new(recipient: UserPubkey, data: String, ttl_ms: u64, timestamp_ms: u64) -> Self {
        let hash = compute_message_hash(timestamp_ms, ttl_ms, &recipient, &data);
        Self {
            recipient,
            data,
            hash,
            ttl_ms,
            timestamp_ms,
        }
    }

    pub fn expiry_ms(&self) -> u64 {
        self.timestamp_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expiry_ms()
    }
}

/// hex(SHA-512(timestamp ‖ ttl ‖ recipient ‖ data)), all fields in their
/// wire string forms. Changing this breaks deduplication across the swarm.
pub fn compute_message_hash(
    timestamp_ms: u64,
    ttl_ms: u64,
    recipient: &UserPubkey,
    data: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(timestamp_ms.to_string());
    hasher.update(ttl_ms.to_string());
    hasher.update(recipient.to_hex());
    hasher.update(data);
    hex::encode(hasher.finalize())
}
