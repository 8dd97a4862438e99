// Networking layer: the authoritative swarm roster, the daemon RPC client,
// and the signed peer-to-peer channels (HTTPS and message queue).

pub mod daemon;
pub mod error;
pub mod mq;
pub mod peer;
pub mod swarm;
pub mod test_protocol;

pub use daemon::DaemonClient;
pub use error::NetError;
pub use peer::PeerClient;
pub use swarm::{swarm_for_pubkey, SwarmEvents, SwarmState, SwarmTracker};
pub use test_protocol::{derive_tester_testee, BlockHashCache, TestStatus};
