pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod keys;
pub mod payload;
pub mod types;

pub use crypto::{ChannelCipher, EncryptType};
pub use error::{CryptoError, KeyError, PayloadError};
pub use identity::Identity;
pub use keys::{Ed25519Pubkey, LegacyPubkey, UserPubkey, X25519Pubkey};
pub use payload::{emit_combined_payload, parse_combined_payload};
pub use types::{BlockUpdate, Message, SnodeRecord, SwarmInfo, INVALID_SWARM_ID};
