use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use haven_shared::types::Message;
use haven_shared::UserPubkey;

#[derive(Default)]
struct Inner {
    // Per-recipient messages kept ordered by (timestamp, hash).
    by_recipient: HashMap<UserPubkey, Vec<Message>>,
    // hash -> recipient, for duplicate detection and storage-test lookups.
    by_hash: HashMap<String, UserPubkey>,
}

/// Message store keyed by recipient pubkey and message hash.
///
/// Messages are immutable once stored; duplicates are idempotent; expiry is
/// driven by [`MessageStore::expire`] from a periodic sweep.
#[derive(Default)]
pub struct MessageStore {
    inner: RwLock<Inner>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the message hash is already present.
    pub fn store(&self, msg: Message) -> bool {
        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&msg.hash) {
            return false;
        }
        inner.by_hash.insert(msg.hash.clone(), msg.recipient);
        let list = inner.by_recipient.entry(msg.recipient).or_default();
        let pos = list
            .binary_search_by(|m| {
                m.timestamp_ms
                    .cmp(&msg.timestamp_ms)
                    .then_with(|| m.hash.cmp(&msg.hash))
            })
            .unwrap_or_else(|p| p);
        list.insert(pos, msg);
        true
    }

    /// Messages for `recipient` newer than the message identified by
    /// `last_hash`. An empty or unknown hash returns everything current.
    pub fn retrieve(&self, recipient: &UserPubkey, last_hash: &str) -> Vec<Message> {
        let inner = self.inner.read();
        let Some(list) = inner.by_recipient.get(recipient) else {
            return Vec::new();
        };
        let since = if last_hash.is_empty() {
            None
        } else {
            list.iter()
                .find(|m| m.hash == last_hash)
                .map(|m| m.timestamp_ms)
        };
        match since {
            Some(ts) => list
                .iter()
                .filter(|m| m.timestamp_ms > ts)
                .cloned()
                .collect(),
            None => list.clone(),
        }
    }

    pub fn retrieve_by_hash(&self, hash: &str) -> Option<Message> {
        let inner = self.inner.read();
        let recipient = inner.by_hash.get(hash)?;
        inner
            .by_recipient
            .get(recipient)?
            .iter()
            .find(|m| m.hash == hash)
            .cloned()
    }

    /// Every stored message; used for swarm handoff pushes and test dumps.
    pub fn get_all(&self) -> Vec<Message> {
        let inner = self.inner.read();
        inner.by_recipient.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every message past its TTL; returns how many were removed.
    pub fn expire(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        inner.by_recipient.retain(|_, list| {
            list.retain(|m| !m.is_expired(now_ms));
            !list.is_empty()
        });
        let by_recipient = std::mem::take(&mut inner.by_recipient);
        inner.by_hash.retain(|hash, recipient| {
            let live = by_recipient
                .get(recipient)
                .map(|list| list.iter().any(|m| &m.hash == hash))
                .unwrap_or(false);
            if !live {
                removed += 1;
            }
            live
        });
        inner.by_recipient = by_recipient;
        if removed > 0 {
            debug!(removed, "Expired messages swept");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(tag: u8) -> UserPubkey {
        UserPubkey::from_hex(&format!("05{}", format!("{tag:02x}").repeat(32))).unwrap()
    }

    fn msg(recipient: UserPubkey, data: &str, ts: u64) -> Message {
        Message::new(recipient, data.to_string(), 60_000, ts)
    }

    #[test]
    fn test_store_and_retrieve_all() {
        let store = MessageStore::new();
        let alice = pk(1);
        assert!(store.store(msg(alice, "YQ==", 100)));
        assert!(store.store(msg(alice, "Yg==", 200)));

        let all = store.retrieve(&alice, "");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp_ms, 100);
        assert_eq!(all[1].timestamp_ms, 200);
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let store = MessageStore::new();
        let m = msg(pk(1), "YQ==", 100);
        assert!(store.store(m.clone()));
        assert!(!store.store(m));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_retrieve_since_last_hash() {
        let store = MessageStore::new();
        let alice = pk(1);
        let first = msg(alice, "YQ==", 100);
        store.store(first.clone());
        store.store(msg(alice, "Yg==", 200));
        store.store(msg(alice, "Yw==", 300));

        let newer = store.retrieve(&alice, &first.hash);
        assert_eq!(newer.len(), 2);
        assert!(newer.iter().all(|m| m.timestamp_ms > 100));
    }

    #[test]
    fn test_retrieve_unknown_last_hash_returns_all() {
        let store = MessageStore::new();
        let alice = pk(1);
        store.store(msg(alice, "YQ==", 100));
        assert_eq!(store.retrieve(&alice, "no-such-hash").len(), 1);
    }

    #[test]
    fn test_recipients_are_isolated() {
        let store = MessageStore::new();
        store.store(msg(pk(1), "YQ==", 100));
        store.store(msg(pk(2), "Yg==", 100));
        assert_eq!(store.retrieve(&pk(1), "").len(), 1);
        assert_eq!(store.retrieve(&pk(3), "").len(), 0);
        assert_eq!(store.get_all().len(), 2);
    }

    #[test]
    fn test_retrieve_by_hash() {
        let store = MessageStore::new();
        let m = msg(pk(1), "YQ==", 100);
        store.store(m.clone());
        assert_eq!(store.retrieve_by_hash(&m.hash), Some(m));
        assert_eq!(store.retrieve_by_hash("missing"), None);
    }

    #[test]
    fn test_expire_sweeps_only_past_ttl() {
        let store = MessageStore::new();
        let alice = pk(1);
        store.store(Message::new(alice, "YQ==".into(), 1_000, 100));
        store.store(Message::new(alice, "Yg==".into(), 1_000_000, 100));

        assert_eq!(store.expire(2_000), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.retrieve(&alice, "").len(), 1);
    }
}
