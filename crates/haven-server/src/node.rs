use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use haven_net::{BlockHashCache, DaemonClient, PeerClient, SwarmTracker, TestStatus};
use haven_shared::constants::MAX_MESSAGE_BODY;
use haven_shared::types::{compute_message_hash, Message};
use haven_shared::{ChannelCipher, Identity};
use haven_store::MessageStore;

use crate::config::Config;
use crate::stats::Stats;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Everything a request needs, shared across the front-end, the MQ server
/// and the swarm controller.
pub struct Node {
    pub config: Config,
    pub identity: Arc<Identity>,
    pub cipher: Arc<ChannelCipher>,
    pub tracker: SwarmTracker,
    pub store: MessageStore,
    pub block_hashes: Mutex<BlockHashCache>,
    pub stats: Stats,
    pub peers: PeerClient,
    pub daemon: DaemonClient,
    cert_signature: String,
}

impl Node {
    pub fn new(config: Config, identity: Identity) -> anyhow::Result<Self> {
        let identity = Arc::new(identity);
        let cipher = Arc::new(ChannelCipher::new(
            identity.x25519_secret().clone(),
            config.enable_legacy_cbc,
        ));

        // The signature over the served certificate lets clients pin this
        // node's transport identity to its registered Ed25519 key.
        let cert_signature = match &config.tls_cert {
            Some(path) => {
                let cert = std::fs::read(path)?;
                identity.sign_cert(&cert)
            }
            None => {
                warn!("No TLS certificate configured; signing over the node pubkey instead");
                identity.sign_cert(identity.ed25519_pubkey().as_bytes())
            }
        };

        let daemon = DaemonClient::new(config.daemon_rpc.clone())?;
        let peers = PeerClient::new(identity.clone(), cipher.clone())?;
        let tracker = SwarmTracker::new(identity.legacy_pubkey());
        let block_hashes = Mutex::new(BlockHashCache::new(config.block_cache));

        info!(
            legacy = %identity.legacy_pubkey(),
            ed25519 = %identity.ed25519_pubkey(),
            x25519 = %identity.x25519_pubkey(),
            "Node identity loaded"
        );

        Ok(Self {
            config,
            identity,
            cipher,
            tracker,
            store: MessageStore::new(),
            block_hashes,
            stats: Stats::default(),
            peers,
            daemon,
            cert_signature,
        })
    }

    pub fn cert_signature(&self) -> &str {
        &self.cert_signature
    }

    /// Ready once the controller has placed us in a swarm.
    pub fn snode_ready(&self) -> Result<(), String> {
        if self.tracker.ready() {
            Ok(())
        } else {
            Err("not yet assigned to a swarm".to_string())
        }
    }

    /// Accept a batch of messages pushed by a swarm peer. Entries whose
    /// hash does not match their content are discarded.
    pub fn process_push_batch(&self, blob: &[u8]) -> usize {
        let batch: Vec<Message> = match bincode::deserialize(blob) {
            Ok(batch) => batch,
            Err(e) => {
                debug!(error = %e, "Discarding unparseable push batch");
                return 0;
            }
        };
        let mut stored = 0;
        for msg in batch {
            if msg.data.len() > MAX_MESSAGE_BODY {
                continue;
            }
            let expected =
                compute_message_hash(msg.timestamp_ms, msg.ttl_ms, &msg.recipient, &msg.data);
            if expected != msg.hash {
                debug!("Discarding pushed message with a forged hash");
                continue;
            }
            if self.store.store(msg) {
                stored += 1;
            }
        }
        if stored > 0 {
            debug!(stored, "Stored messages from peer push");
        }
        stored
    }

    /// Testee side of the storage test: a single check against the block
    /// window, the derived pairing and the store. `Retry` means the answer
    /// may change once gossip catches up.
    pub fn process_storage_test_req(
        &self,
        height: u64,
        tester: &haven_shared::LegacyPubkey,
        msg_hash: &str,
    ) -> TestStatus {
        let block_hash = {
            let cache = self.block_hashes.lock();
            match cache.get(height) {
                Some(hash) => hash.to_string(),
                None => {
                    if cache.is_too_old(height) {
                        return TestStatus::WrongReq;
                    }
                    // Above our tip, or a height our poll never observed;
                    // either way the block may still arrive.
                    return TestStatus::Retry;
                }
            }
        };

        let snapshot = self.tracker.snapshot();
        let members = snapshot.our_swarm_members();
        let Some((expected_tester, expected_testee)) =
            haven_net::derive_tester_testee(&block_hash, members)
        else {
            return TestStatus::WrongReq;
        };
        if &expected_tester != tester || expected_testee != self.identity.legacy_pubkey() {
            debug!(height, tester = %tester, "Storage test pairing mismatch");
            return TestStatus::WrongReq;
        }

        match self.store.retrieve_by_hash(msg_hash) {
            Some(msg) => TestStatus::Success(msg.data),
            None => TestStatus::Retry,
        }
    }
}
