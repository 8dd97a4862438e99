use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{PUBKEY_SIZE, USER_PUBKEY_SIZE};
use crate::error::KeyError;

/// z-base-32 alphabet; legacy pubkeys travel in peer headers in this form.
const BASE32Z_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

macro_rules! pubkey_type {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; PUBKEY_SIZE]);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, KeyError> {
                let mut bytes = [0u8; PUBKEY_SIZE];
                decode_hex_exact(s, &mut bytes)?;
                Ok(Self(bytes))
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
                let arr: [u8; PUBKEY_SIZE] =
                    bytes.try_into().map_err(|_| KeyError::BadKeyBytes)?;
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
                &self.0
            }

            /// True for the all-zero placeholder the daemon emits while a
            /// node's keys are not yet known.
            pub fn is_default(&self) -> bool {
                self.0 == [0u8; PUBKEY_SIZE]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

pubkey_type!(LegacyPubkey);
pubkey_type!(Ed25519Pubkey);
pubkey_type!(X25519Pubkey);

impl LegacyPubkey {
    pub fn to_base32z(&self) -> String {
        base32z_encode(&self.0)
    }

    pub fn from_base32z(s: &str) -> Result<Self, KeyError> {
        let bytes = base32z_decode(s)?;
        Self::from_bytes(&bytes)
    }

    /// Legacy ".snode" address form retained for old clients.
    pub fn snode_address(&self) -> String {
        format!("{}.snode", self.to_base32z())
    }
}

/// 33-byte recipient identifier: a network-tag byte followed by the
/// recipient's X25519 key. String form is 66 hex chars, case-insensitive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserPubkey([u8; USER_PUBKEY_SIZE]);

impl UserPubkey {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let mut bytes = [0u8; USER_PUBKEY_SIZE];
        decode_hex_exact(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn network_tag(&self) -> u8 {
        self.0[0]
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for UserPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for UserPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the tag and the edges; user keys should not be logged whole.
        let h = self.to_hex();
        write!(f, "UserPubkey({}...{})", &h[..4], &h[h.len() - 3..])
    }
}

impl Serialize for UserPubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for UserPubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_hex_exact(s: &str, out: &mut [u8]) -> Result<(), KeyError> {
    if s.len() != out.len() * 2 {
        return Err(KeyError::BadHexLength {
            expected: out.len() * 2,
            got: s.len(),
        });
    }
    hex::decode_to_slice(s, out)?;
    Ok(())
}

pub fn base32z_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32Z_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32Z_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

pub fn base32z_decode(s: &str) -> Result<Vec<u8>, KeyError> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for c in s.bytes() {
        let val = BASE32Z_ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_lowercase())
            .ok_or(KeyError::BadBase32z)? as u64;
        buffer = (buffer << 5) | val;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    // Leftover bits are padding and must be zero.
    if bits > 0 && (buffer & ((1 << bits) - 1)) != 0 {
        return Err(KeyError::BadBase32z);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pubkey_hex_roundtrip() {
        let hex = "ab".repeat(32);
        let pk = LegacyPubkey::from_hex(&hex).unwrap();
        assert_eq!(pk.to_hex(), hex);
        assert_eq!(pk.0, [0xab; 32]);
    }

    #[test]
    fn test_pubkey_hex_case_insensitive() {
        let upper = LegacyPubkey::from_hex(&"AB".repeat(32)).unwrap();
        let lower = LegacyPubkey::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_pubkey_hex_wrong_length() {
        assert!(Ed25519Pubkey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_user_pubkey_split() {
        let hex = format!("05{}", "cd".repeat(32));
        let pk = UserPubkey::from_hex(&hex).unwrap();
        assert_eq!(pk.network_tag(), 0x05);
        assert_eq!(pk.key_bytes(), &[0xcd; 32][..]);
        assert_eq!(pk.to_hex(), hex);
    }

    #[test]
    fn test_user_pubkey_rejects_32_bytes() {
        assert!(UserPubkey::from_hex(&"ab".repeat(32)).is_err());
    }

    #[test]
    fn test_base32z_roundtrip() {
        let data: Vec<u8> = (0u8..32).collect();
        let encoded = base32z_encode(&data);
        assert_eq!(encoded.len(), 52);
        assert_eq!(base32z_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_base32z_known_value() {
        // 0xff 0xff -> 11111111 11111111 -> 11111 11111 11111 1(0000)
        assert_eq!(base32z_encode(&[0xff, 0xff]), "999o");
        assert_eq!(base32z_decode("999o").unwrap(), vec![0xff, 0xff]);
    }

    #[test]
    fn test_base32z_rejects_bad_padding() {
        // "9999" decodes to 20 bits; the trailing 4 bits are not zero.
        assert!(base32z_decode("9999").is_err());
    }

    #[test]
    fn test_snode_address() {
        let pk = LegacyPubkey([0u8; 32]);
        let addr = pk.snode_address();
        assert!(addr.ends_with(".snode"));
        assert_eq!(addr.len(), 52 + 6);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let pk = X25519Pubkey([0x11; 32]);
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(32)));
        let back: X25519Pubkey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }
}
