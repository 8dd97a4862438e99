/// Size of every public key type on the wire, in bytes
pub const PUBKEY_SIZE: usize = 32;

/// User pubkey = 1 network-tag byte + 32 key bytes
pub const USER_PUBKEY_SIZE: usize = 33;

/// Ed25519 detached signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// AES-256-GCM nonce size in bytes
pub const GCM_NONCE_SIZE: usize = 12;

/// AES-256-CBC IV size in bytes
pub const CBC_IV_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size in bytes
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 / GCM authentication tag size in bytes
pub const AEAD_TAG_SIZE: usize = 16;

/// Salt for the AES-GCM key derivation (HMAC-SHA256 key)
pub const GCM_KDF_SALT: &[u8] = b"LOKI";

/// Maximum size of a single stored message body (base64 form)
pub const MAX_MESSAGE_BODY: usize = 102_400; // 100 KiB

/// Maximum size of any inbound request body
pub const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024; // 10 MiB

/// Sentinel swarm id meaning "not assigned to any swarm"
pub const INVALID_SWARM_ID: u64 = u64::MAX;

/// Peer request header carrying the sender's legacy pubkey (base32z)
pub const SNODE_SENDER_HEADER: &str = "x-haven-snode-sender";

/// Peer request header carrying the Ed25519 signature over the body (base64)
pub const SNODE_SIGNATURE_HEADER: &str = "x-haven-snode-signature";

/// Obsolete long-polling header; requests carrying it get 410 Gone
pub const LONG_POLL_HEADER: &str = "x-haven-long-poll";
