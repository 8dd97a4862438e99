use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub https_addr: SocketAddr,
    pub mq_port: u16,
    pub daemon_rpc: String,
    pub workers: usize,
    pub worker_queue: usize,

    pub client_rate: f64,
    pub client_burst: f64,
    pub peer_rate: f64,
    pub peer_burst: f64,

    pub min_ttl_ms: u64,
    pub max_ttl_ms: u64,
    pub max_clock_skew_ms: u64,
    pub block_cache: usize,

    pub enable_legacy_cbc: bool,
    pub cors: bool,
    pub tls_cert: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            https_addr: ([0, 0, 0, 0], 22021).into(),
            mq_port: 22020,
            daemon_rpc: "http://127.0.0.1:22023".to_string(),
            workers: 4,
            worker_queue: 512,

            client_rate: 0.2,
            client_burst: 10.0,
            peer_rate: 10.0,
            peer_burst: 100.0,

            min_ttl_ms: 10_000,
            max_ttl_ms: 14 * 24 * 60 * 60 * 1000,
            max_clock_skew_ms: 10 * 60 * 1000,
            block_cache: 128,

            enable_legacy_cbc: false,
            cors: true,
            tls_cert: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HAVEN_HTTPS_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.https_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HAVEN_HTTPS_ADDR, using default"),
            }
        }

        if let Ok(port) = std::env::var("HAVEN_MQ_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.mq_port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid HAVEN_MQ_PORT, using default"),
            }
        }

        if let Ok(url) = std::env::var("HAVEN_DAEMON_RPC") {
            config.daemon_rpc = url;
        }

        if let Ok(val) = std::env::var("HAVEN_WORKERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.workers = n.max(1);
            }
        }

        parse_f64(&mut config.client_rate, "HAVEN_CLIENT_RATE");
        parse_f64(&mut config.client_burst, "HAVEN_CLIENT_BURST");
        parse_f64(&mut config.peer_rate, "HAVEN_PEER_RATE");
        parse_f64(&mut config.peer_burst, "HAVEN_PEER_BURST");

        parse_u64(&mut config.min_ttl_ms, "HAVEN_MIN_TTL_MS");
        parse_u64(&mut config.max_ttl_ms, "HAVEN_MAX_TTL_MS");
        parse_u64(&mut config.max_clock_skew_ms, "HAVEN_MAX_CLOCK_SKEW_MS");

        if let Ok(val) = std::env::var("HAVEN_BLOCK_CACHE") {
            if let Ok(n) = val.parse::<usize>() {
                config.block_cache = n.max(1);
            }
        }

        if let Ok(val) = std::env::var("HAVEN_ENABLE_LEGACY_CBC") {
            config.enable_legacy_cbc = val == "1" || val == "true";
        }

        if let Ok(val) = std::env::var("HAVEN_CORS") {
            config.cors = val != "false" && val != "0";
        }

        if let Ok(path) = std::env::var("HAVEN_TLS_CERT") {
            if !path.is_empty() {
                config.tls_cert = Some(PathBuf::from(path));
            }
        }

        config
    }
}

fn parse_f64(slot: &mut f64, var: &str) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<f64>() {
            Ok(parsed) if parsed > 0.0 => *slot = parsed,
            _ => tracing::warn!(value = %val, var, "Invalid rate value, using default"),
        }
    }
}

fn parse_u64(slot: &mut u64, var: &str) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<u64>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(value = %val, var, "Invalid value, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.https_addr, ([0, 0, 0, 0], 22021).into());
        assert_eq!(config.workers, 4);
        assert_eq!(config.block_cache, 128);
        assert!(!config.enable_legacy_cbc);
        assert_eq!(config.max_ttl_ms, 1_209_600_000);
    }
}
