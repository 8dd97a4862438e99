use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};
use chacha20poly1305::{aead::Aead as _, KeyInit as _, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::constants::{
    AEAD_TAG_SIZE, CBC_IV_SIZE, GCM_KDF_SALT, GCM_NONCE_SIZE, XCHACHA_NONCE_SIZE,
};
use crate::error::CryptoError;
use crate::keys::X25519Pubkey;

type HmacSha256 = Hmac<Sha256>;
type Blake2b256 = Blake2b<U32>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encryption scheme tag carried alongside (never inside) the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptType {
    AesGcm,
    AesCbc,
    XChaCha20,
}

impl EncryptType {
    /// Accepts the wire aliases old clients still send.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "aes-gcm" | "gcm" => Ok(Self::AesGcm),
            "aes-cbc" | "cbc" => Ok(Self::AesCbc),
            "xchacha20" | "xchacha20-poly1305" => Ok(Self::XChaCha20),
            other => Err(CryptoError::UnknownEncType(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AesGcm => "aes-gcm",
            Self::AesCbc => "aes-cbc",
            Self::XChaCha20 => "xchacha20-poly1305",
        })
    }
}

/// Per-peer channel encryption over a derived X25519 shared secret.
///
/// Wire layout for every scheme is `nonce ‖ body ‖ [tag]`; the scheme tag
/// travels outside the ciphertext.
pub struct ChannelCipher {
    secret: StaticSecret,
    public: X25519Pubkey,
    allow_legacy_cbc: bool,
}

impl ChannelCipher {
    pub fn new(secret: StaticSecret, allow_legacy_cbc: bool) -> Self {
        let public = X25519Pubkey(X25519Public::from(&secret).to_bytes());
        Self {
            secret,
            public,
            allow_legacy_cbc,
        }
    }

    pub fn public_key(&self) -> X25519Pubkey {
        self.public
    }

    pub fn encrypt(
        &self,
        enc_type: EncryptType,
        plaintext: &[u8],
        peer: &X25519Pubkey,
    ) -> Result<Vec<u8>, CryptoError> {
        match enc_type {
            EncryptType::AesGcm => self.encrypt_gcm(plaintext, peer),
            EncryptType::AesCbc => self.encrypt_cbc(plaintext, peer),
            EncryptType::XChaCha20 => self.encrypt_xchacha(plaintext, peer, true),
        }
    }

    pub fn decrypt(
        &self,
        enc_type: EncryptType,
        ciphertext: &[u8],
        peer: &X25519Pubkey,
    ) -> Result<Vec<u8>, CryptoError> {
        match enc_type {
            EncryptType::AesGcm => self.decrypt_gcm(ciphertext, peer),
            EncryptType::AesCbc => self.decrypt_cbc(ciphertext, peer),
            EncryptType::XChaCha20 => self.decrypt_xchacha(ciphertext, peer, false),
        }
    }

    // Raw scalar multiplication; the all-zero point means a bad peer key.
    fn shared_secret(&self, peer: &X25519Pubkey) -> Result<[u8; 32], CryptoError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519Public::from(*peer.as_bytes()));
        let bytes = shared.to_bytes();
        if bytes == [0u8; 32] {
            return Err(CryptoError::KeyDerivation);
        }
        Ok(bytes)
    }

    // HMAC-SHA256 with a fixed salt key over the shared secret.
    fn gcm_key(&self, peer: &X25519Pubkey) -> Result<[u8; 32], CryptoError> {
        let shared = self.shared_secret(peer)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(GCM_KDF_SALT)
            .map_err(|_| CryptoError::KeyDerivation)?;
        mac.update(&shared);
        Ok(mac.finalize().into_bytes().into())
    }

    // BLAKE2b-32 over shared ‖ sender_pub ‖ receiver_pub; the two sides
    // feed the pubkeys in opposite order so the keys agree.
    fn xchacha_key(
        &self,
        peer: &X25519Pubkey,
        sending: bool,
    ) -> Result<[u8; 32], CryptoError> {
        let shared = self.shared_secret(peer)?;
        let (first, second) = if sending {
            (&self.public, peer)
        } else {
            (peer, &self.public)
        };
        let digest = Blake2b256::new()
            .chain_update(shared)
            .chain_update(first.as_bytes())
            .chain_update(second.as_bytes())
            .finalize();
        Ok(digest.into())
    }

    fn encrypt_gcm(
        &self,
        plaintext: &[u8],
        peer: &X25519Pubkey,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.gcm_key(peer)?;
        let cipher = Aes256Gcm::new(&key.into());

        let mut nonce = [0u8; GCM_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_gcm(
        &self,
        data: &[u8],
        peer: &X25519Pubkey,
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() < GCM_NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(CryptoError::BadCiphertext);
        }
        let key = self.gcm_key(peer)?;
        let cipher = Aes256Gcm::new(&key.into());
        let (nonce, ciphertext) = data.split_at(GCM_NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::BadCiphertext)
    }

    // Legacy proxy channel only: raw shared secret as key, PKCS#7, no tag.
    fn encrypt_cbc(
        &self,
        plaintext: &[u8],
        peer: &X25519Pubkey,
    ) -> Result<Vec<u8>, CryptoError> {
        self.check_cbc_allowed()?;
        let key = self.shared_secret(peer)?;

        let mut iv = [0u8; CBC_IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(CBC_IV_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_cbc(&self, data: &[u8], peer: &X25519Pubkey) -> Result<Vec<u8>, CryptoError> {
        self.check_cbc_allowed()?;
        if data.len() <= CBC_IV_SIZE {
            return Err(CryptoError::BadCiphertext);
        }
        let key = self.shared_secret(peer)?;
        let (iv, ciphertext) = data.split_at(CBC_IV_SIZE);
        Aes256CbcDec::new_from_slices(&key, iv)
            .map_err(|_| CryptoError::BadCiphertext)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadCiphertext)
    }

    fn encrypt_xchacha(
        &self,
        plaintext: &[u8],
        peer: &X25519Pubkey,
        sending: bool,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.xchacha_key(peer, sending)?;
        let cipher = XChaCha20Poly1305::new(&key.into());

        let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(XCHACHA_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_xchacha(
        &self,
        data: &[u8],
        peer: &X25519Pubkey,
        sending: bool,
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() < XCHACHA_NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(CryptoError::BadCiphertext);
        }
        let key = self.xchacha_key(peer, sending)?;
        let cipher = XChaCha20Poly1305::new(&key.into());
        let (nonce, ciphertext) = data.split_at(XCHACHA_NONCE_SIZE);
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::BadCiphertext)
    }

    fn check_cbc_allowed(&self) -> Result<(), CryptoError> {
        if self.allow_legacy_cbc {
            Ok(())
        } else {
            Err(CryptoError::DisabledEncType("aes-cbc"))
        }
    }
}
