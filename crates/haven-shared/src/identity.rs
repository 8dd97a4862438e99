use base64::{engine::general_purpose::STANDARD as b64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::KeyError;
use crate::keys::{Ed25519Pubkey, LegacyPubkey, X25519Pubkey};

// The node identity: the legacy key signs peer requests, the Ed25519 key
// signs onion-relevant material, the X25519 key is the channel key.
#[derive(Clone)]
pub struct Identity {
    legacy_key: SigningKey,
    ed25519_key: SigningKey,
    x25519_secret: StaticSecret,
}

impl Identity {
    pub fn generate() -> Self {
        let legacy_key = SigningKey::generate(&mut OsRng);
        let ed25519_key = SigningKey::generate(&mut OsRng);
        let x25519_secret = StaticSecret::random_from_rng(OsRng);
        Self {
            legacy_key,
            ed25519_key,
            x25519_secret,
        }
    }

    pub fn from_secret_bytes(
        legacy: &[u8; 32],
        ed25519: &[u8; 32],
        x25519: [u8; 32],
    ) -> Self {
        Self {
            legacy_key: SigningKey::from_bytes(legacy),
            ed25519_key: SigningKey::from_bytes(ed25519),
            x25519_secret: StaticSecret::from(x25519),
        }
    }

    pub fn legacy_pubkey(&self) -> LegacyPubkey {
        LegacyPubkey(self.legacy_key.verifying_key().to_bytes())
    }

    pub fn ed25519_pubkey(&self) -> Ed25519Pubkey {
        Ed25519Pubkey(self.ed25519_key.verifying_key().to_bytes())
    }

    pub fn x25519_pubkey(&self) -> X25519Pubkey {
        X25519Pubkey(X25519Public::from(&self.x25519_secret).to_bytes())
    }

    pub fn x25519_secret(&self) -> &StaticSecret {
        &self.x25519_secret
    }

    /// Sign the SHA-512 digest of `payload` with the legacy key; base64.
    pub fn sign_request(&self, payload: &[u8]) -> String {
        let digest = Sha512::digest(payload);
        let sig = self.legacy_key.sign(&digest);
        b64.encode(sig.to_bytes())
    }

    /// Sign the SHA-512 digest of `payload` with the Ed25519 key; base64.
    /// Used for the certificate signature served on every HTTPS response.
    pub fn sign_cert(&self, payload: &[u8]) -> String {
        let digest = Sha512::digest(payload);
        let sig = self.ed25519_key.sign(&digest);
        b64.encode(sig.to_bytes())
    }
}

/// Verify a base64 detached signature over the SHA-512 digest of `payload`.
pub fn verify_request_signature(
    pubkey: &LegacyPubkey,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), KeyError> {
    let sig_bytes = b64
        .decode(signature_b64)
        .map_err(|_| KeyError::BadSignature)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| KeyError::BadSignature)?;
    let key = VerifyingKey::from_bytes(pubkey.as_bytes()).map_err(|_| KeyError::BadKeyBytes)?;
    let digest = Sha512::digest(payload);
    key.verify(&digest, &sig).map_err(|_| KeyError::BadSignature)
}
