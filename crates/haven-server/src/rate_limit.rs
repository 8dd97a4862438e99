use std::collections::HashMap;
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::time::Instant;

use parking_lot::Mutex;

use haven_shared::LegacyPubkey;

use crate::config::Config;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct BucketMap<K> {
    buckets: Mutex<HashMap<K, TokenBucket>>,
    rate: f64,
    capacity: f64,
}

impl<K: Eq + Hash + Copy> BucketMap<K> {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            capacity,
        }
    }

    fn should_rate_limit(&self, key: K) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        !bucket.try_consume(self.rate, self.capacity)
    }

    fn purge_stale(&self, max_idle_secs: f64) {
        let now = Instant::now();
        self.buckets.lock().retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

/// Token-bucket throttling: clients are keyed by IPv4 address, peers by
/// their legacy pubkey, with independent buckets per key.
pub struct RateLimiter {
    clients: BucketMap<Ipv4Addr>,
    peers: BucketMap<LegacyPubkey>,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            clients: BucketMap::new(config.client_rate, config.client_burst),
            peers: BucketMap::new(config.peer_rate, config.peer_burst),
        }
    }

    pub fn should_rate_limit_client(&self, ip: Ipv4Addr) -> bool {
        self.clients.should_rate_limit(ip)
    }

    pub fn should_rate_limit_peer(&self, pk: LegacyPubkey) -> bool {
        self.peers.should_rate_limit(pk)
    }

    pub fn purge_stale(&self, max_idle_secs: f64) {
        self.clients.purge_stale(max_idle_secs);
        self.peers.purge_stale(max_idle_secs);
    }
}
