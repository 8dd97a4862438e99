use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Peer request timed out")]
    Timeout,

    #[error("Next node not found: {0}")]
    UnknownNode(String),

    #[error("Invalid response from peer: {0}")]
    BadResponse(String),

    #[error("Daemon RPC error: {0}")]
    Daemon(String),

    #[error("Message queue I/O error: {0}")]
    MqIo(#[from] std::io::Error),

    #[error("Message queue framing error: {0}")]
    MqFrame(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] haven_shared::CryptoError),

    #[error("Wire encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}
