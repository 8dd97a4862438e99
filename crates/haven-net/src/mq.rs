use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use haven_shared::constants::MAX_REQUEST_BODY;
use haven_shared::{ChannelCipher, EncryptType, X25519Pubkey};

use crate::error::NetError;

/// Commands a peer may invoke over the message queue.
pub const CMD_DATA: &str = "sn.data";
pub const CMD_ONION_REQ: &str = "sn.onion_req";

/// Outer frame payload: the sender identifies itself by its X25519 key and
/// everything else rides inside the channel-encrypted ciphertext.
#[derive(Debug, Serialize, Deserialize)]
pub struct MqEnvelope {
    pub sender_x25519: X25519Pubkey,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct MqRequest {
    pub command: String,
    pub parts: Vec<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct MqReply {
    pub parts: Vec<Vec<u8>>,
}

/// Reads one `[u32-LE length][payload]` frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, NetError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_REQUEST_BODY {
        return Err(NetError::MqFrame(format!(
            "frame of {len} bytes exceeds the {MAX_REQUEST_BODY} byte limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), NetError> {
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encrypt a request (or reply) body into an envelope addressed to `peer`.
pub fn seal<T: Serialize>(
    cipher: &ChannelCipher,
    peer: &X25519Pubkey,
    body: &T,
) -> Result<MqEnvelope, NetError> {
    let plain = bincode::serialize(body)?;
    let ciphertext = cipher.encrypt(EncryptType::XChaCha20, &plain, peer)?;
    Ok(MqEnvelope {
        sender_x25519: cipher.public_key(),
        ciphertext,
    })
}

/// Decrypt an envelope's body; authenticity comes from the AEAD opening
/// only under the claimed sender's key.
pub fn open<T: for<'de> Deserialize<'de>>(
    cipher: &ChannelCipher,
    envelope: &MqEnvelope,
) -> Result<T, NetError> {
    let plain = cipher.decrypt(
        EncryptType::XChaCha20,
        &envelope.ciphertext,
        &envelope.sender_x25519,
    )?;
    Ok(bincode::deserialize(&plain)?)
}

/// Metadata accompanying a relayed onion ciphertext. On the wire this is
/// either a bare 64-char hex key (defaults apply) or a JSON control blob.
#[derive(Debug, Clone, PartialEq)]
pub struct OnionControl {
    pub ephemeral_key: X25519Pubkey,
    pub enc_type: EncryptType,
    pub hop_no: u32,
}

impl OnionControl {
    pub fn encode(&self) -> Vec<u8> {
        if self.enc_type == EncryptType::AesGcm && self.hop_no == 0 {
            return self.ephemeral_key.to_hex().into_bytes();
        }
        json!({
            "ephemeral_key": self.ephemeral_key.to_hex(),
            "enc_type": self.enc_type.to_string(),
            "hop_no": self.hop_no,
        })
        .to_string()
        .into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, NetError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| NetError::BadResponse("onion control part is not UTF-8".into()))?;

        if let Ok(key) = X25519Pubkey::from_hex(text) {
            return Ok(Self {
                ephemeral_key: key,
                enc_type: EncryptType::AesGcm,
                hop_no: 0,
            });
        }

        let meta: Value = serde_json::from_str(text)
            .map_err(|_| NetError::BadResponse("onion control part is not hex or JSON".into()))?;
        let key_hex = meta
            .get("ephemeral_key")
            .and_then(Value::as_str)
            .ok_or_else(|| NetError::BadResponse("onion control lacks ephemeral_key".into()))?;
        let ephemeral_key = X25519Pubkey::from_hex(key_hex)
            .map_err(|e| NetError::BadResponse(format!("bad ephemeral_key: {e}")))?;
        let enc_type = match meta.get("enc_type").and_then(Value::as_str) {
            Some(s) => EncryptType::parse(s)
                .map_err(|e| NetError::BadResponse(format!("bad enc_type: {e}")))?,
            None => EncryptType::AesGcm,
        };
        let hop_no = meta
            .get("hop_no")
            .and_then(Value::as_i64)
            .map(|n| n.max(0) as u32)
            .unwrap_or(0);
        Ok(Self {
            ephemeral_key,
            enc_type,
            hop_no,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use x25519_dalek::StaticSecret;

    fn cipher() -> ChannelCipher {
        ChannelCipher::new(StaticSecret::random_from_rng(OsRng), false)
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_frame_rejects_oversize() {
        let mut buf = ((MAX_REQUEST_BODY + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"x");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(NetError::MqFrame(_))
        ));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let us = cipher();
        let them = cipher();
        let req = MqRequest {
            command: CMD_DATA.into(),
            parts: vec![vec![1, 2, 3]],
        };
        let envelope = seal(&us, &them.public_key(), &req).unwrap();
        assert_eq!(envelope.sender_x25519, us.public_key());
        let back: MqRequest = open(&them, &envelope).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_open_rejects_spoofed_sender() {
        let us = cipher();
        let them = cipher();
        let intruder = cipher();
        let req = MqRequest {
            command: CMD_DATA.into(),
            parts: vec![],
        };
        let mut envelope = seal(&us, &them.public_key(), &req).unwrap();
        // Claiming another sender breaks the derived key.
        envelope.sender_x25519 = intruder.public_key();
        assert!(open::<MqRequest>(&them, &envelope).is_err());
    }

    #[test]
    fn test_onion_control_bare_hex() {
        let control = OnionControl {
            ephemeral_key: X25519Pubkey([0xee; 32]),
            enc_type: EncryptType::AesGcm,
            hop_no: 0,
        };
        let encoded = control.encode();
        assert_eq!(encoded, "ee".repeat(32).into_bytes());
        assert_eq!(OnionControl::decode(&encoded).unwrap(), control);
    }

    #[test]
    fn test_onion_control_json_form() {
        let control = OnionControl {
            ephemeral_key: X25519Pubkey([0xee; 32]),
            enc_type: EncryptType::XChaCha20,
            hop_no: 3,
        };
        let encoded = control.encode();
        assert!(encoded.starts_with(b"{"));
        assert_eq!(OnionControl::decode(&encoded).unwrap(), control);
    }

    #[test]
    fn test_onion_control_rejects_garbage() {
        assert!(OnionControl::decode(b"not a key").is_err());
        assert!(OnionControl::decode(b"{\"enc_type\":\"aes-gcm\"}").is_err());
    }
}
