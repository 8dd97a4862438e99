use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};

use haven_shared::LegacyPubkey;

/// Storage-test results older than this fall out of the report.
const ROLLING_WINDOW_MS: u64 = 120 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct TestResult {
    pub timestamp_ms: u64,
    pub peer: LegacyPubkey,
    pub passed: bool,
}

/// Node counters served by `/get_stats/v1`.
#[derive(Default)]
pub struct Stats {
    client_store_requests: AtomicU64,
    client_retrieve_requests: AtomicU64,
    onion_requests: AtomicU64,
    last_ping_https_ms: AtomicU64,
    last_ping_mq_ms: AtomicU64,
    storage_tests: Mutex<VecDeque<TestResult>>,
}

impl Stats {
    pub fn record_store(&self) {
        self.client_store_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retrieve(&self) {
        self.client_retrieve_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_onion_request(&self) {
        self.onion_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping_https(&self, now_ms: u64) {
        self.last_ping_https_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_ping_mq(&self, now_ms: u64) {
        self.last_ping_mq_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_storage_test(&self, now_ms: u64, peer: LegacyPubkey, passed: bool) {
        let mut tests = self.storage_tests.lock();
        tests.push_back(TestResult {
            timestamp_ms: now_ms,
            peer,
            passed,
        });
        let cutoff = now_ms.saturating_sub(ROLLING_WINDOW_MS);
        while tests.front().is_some_and(|t| t.timestamp_ms < cutoff) {
            tests.pop_front();
        }
    }

    pub fn snapshot(&self, version: &str) -> Value {
        let tests = self.storage_tests.lock();
        let passed = tests.iter().filter(|t| t.passed).count();
        json!({
            "version": version,
            "client_store_requests": self.client_store_requests.load(Ordering::Relaxed),
            "client_retrieve_requests": self.client_retrieve_requests.load(Ordering::Relaxed),
            "onion_requests": self.onion_requests.load(Ordering::Relaxed),
            "last_ping_https": self.last_ping_https_ms.load(Ordering::Relaxed),
            "last_ping_mq": self.last_ping_mq_ms.load(Ordering::Relaxed),
            "storage_tests": {
                "window_total": tests.len(),
                "window_passed": passed,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::default();
        stats.record_store();
        stats.record_store();
        stats.record_onion_request();
        let snap = stats.snapshot("2.1.0");
        assert_eq!(snap["version"], "2.1.0");
        assert_eq!(snap["client_store_requests"], 2);
        assert_eq!(snap["onion_requests"], 1);
    }

    #[test]
    fn test_rolling_window_drops_old_results() {
        let stats = Stats::default();
        let peer = LegacyPubkey([1; 32]);
        stats.record_storage_test(1_000, peer, true);
        stats.record_storage_test(1_000 + ROLLING_WINDOW_MS + 1, peer, false);
        let snap = stats.snapshot("x");
        assert_eq!(snap["storage_tests"]["window_total"], 1);
        assert_eq!(snap["storage_tests"]["window_passed"], 0);
    }
}
