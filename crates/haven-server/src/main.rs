mod api;
mod config;
mod controller;
mod error;
mod handler;
mod mq_server;
mod node;
mod onion;
mod rate_limit;
mod stats;
mod workers;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use haven_net::DaemonClient;
use haven_shared::Identity;

use crate::api::AppState;
use crate::config::Config;
use crate::node::Node;
use crate::rate_limit::RateLimiter;
use crate::workers::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,haven_server=debug")),
        )
        .init();

    info!(
        "Starting haven storage node v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env();
    info!(?config, "Loaded configuration");

    let identity = load_identity(&config).await;
    let node = Arc::new(Node::new(config.clone(), identity)?);

    let limiter = Arc::new(RateLimiter::new(&config));
    let workers = Arc::new(WorkerPool::new(config.workers, config.worker_queue));

    // Rate limiter cleanup every 5 min; evict buckets idle >10 min.
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter.purge_stale(600.0);
            }
        });
    }

    tokio::spawn(controller::run(node.clone()));

    {
        let node = node.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            if let Err(e) = mq_server::serve(node, limiter).await {
                error!(error = %e, "MQ server failed");
            }
        });
    }

    let https_addr = config.https_addr;
    let state = AppState {
        node,
        workers,
        limiter,
    };

    tokio::select! {
        result = api::serve(state, https_addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTPS front-end failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// The node's keys live with the blockchain daemon; a node running without
/// one (dev setups) gets a throwaway identity.
async fn load_identity(config: &Config) -> Identity {
    let daemon = match DaemonClient::new(config.daemon_rpc.clone()) {
        Ok(daemon) => daemon,
        Err(e) => {
            warn!(error = %e, "Could not reach daemon; generating ephemeral identity");
            return Identity::generate();
        }
    };
    match daemon.get_service_node_privkey().await {
        Ok((legacy, ed25519, x25519)) => {
            Identity::from_secret_bytes(&legacy, &ed25519, x25519)
        }
        Err(e) => {
            warn!(
                error = %e,
                "Could not fetch service node keys from daemon; generating ephemeral identity"
            );
            Identity::generate()
        }
    }
}
