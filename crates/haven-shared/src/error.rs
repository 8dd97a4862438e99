use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    // Deliberately covers every decrypt failure mode; callers must not be
    // able to distinguish a bad tag from a short buffer.
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    BadCiphertext,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Unknown encryption type: {0}")]
    UnknownEncType(String),

    #[error("Encryption type {0} is disabled")]
    DisabledEncType(&'static str),
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Expected {expected} hex characters, got {got}")]
    BadHexLength { expected: usize, got: usize },

    #[error("Invalid hex: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("Invalid base32z input")]
    BadBase32z,

    #[error("Invalid key bytes")]
    BadKeyBytes,

    #[error("Invalid signature encoding")]
    BadSignature,
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Payload too short: expected ciphertext size prefix")]
    MissingPrefix,

    #[error("Payload too short: ciphertext length {expected} exceeds remaining {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Trailing metadata is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}
