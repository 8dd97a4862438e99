use std::collections::VecDeque;

use haven_shared::types::SnodeRecord;
use haven_shared::LegacyPubkey;

/// How often a testee re-checks its store for a not-yet-arrived message.
pub const TEST_RETRY_INTERVAL_MS: u64 = 50;

/// How long a testee keeps retrying before giving up.
pub const TEST_RETRY_PERIOD_MS: u64 = 60_000;

/// Outcome of a storage test on the testee side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestStatus {
    /// Message found; carries its wire (base64) data.
    Success(String),
    /// The tester/testee pairing is not valid at that height.
    WrongReq,
    /// Not found yet; gossip may still deliver it.
    Retry,
}

/// Bounded height → block-hash map over the most recent blocks. Storage
/// tests reference heights by hash; anything older than the window is
/// conclusively out of range.
pub struct BlockHashCache {
    entries: VecDeque<(u64, String)>,
    capacity: usize,
}

impl BlockHashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, height: u64, block_hash: String) {
        if let Some(&(tip, _)) = self.entries.back() {
            if height <= tip {
                return;
            }
        }
        self.entries.push_back((height, block_hash));
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, height: u64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(h, _)| *h == height)
            .map(|(_, hash)| hash.as_str())
    }

    pub fn tip(&self) -> Option<u64> {
        self.entries.back().map(|(h, _)| *h)
    }

    /// Below the retained window: requests for such heights can never be
    /// answered and are rejected rather than retried.
    pub fn is_too_old(&self, height: u64) -> bool {
        match self.entries.front() {
            Some(&(oldest, _)) => height < oldest,
            None => false,
        }
    }
}

/// Deterministically picks the (tester, testee) pair for a block from its
/// hash; every node in the swarm derives the same pair.
pub fn derive_tester_testee(
    block_hash: &str,
    members: &[SnodeRecord],
) -> Option<(LegacyPubkey, LegacyPubkey)> {
    if members.len() < 2 {
        return None;
    }
    let mut keys: Vec<LegacyPubkey> = members.iter().map(|sn| sn.pubkey_legacy).collect();
    keys.sort();

    let seed = fold_hash_seed(block_hash);
    let n = keys.len() as u64;
    let tester = keys[(seed % n) as usize];
    let testee = keys[((seed + 1) % n) as usize];
    Some((tester, testee))
}

fn fold_hash_seed(block_hash: &str) -> u64 {
    let mut seed = 0u64;
    for chunk in block_hash.as_bytes().chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        seed ^= u64::from_le_bytes(word);
    }
    seed
}
