use serde_json::Value;

use crate::error::PayloadError;

/// Splits a combined payload `[u32-LE N][N bytes ciphertext][JSON]` into its
/// ciphertext and trailing metadata object.
pub fn parse_combined_payload(payload: &[u8]) -> Result<(Vec<u8>, Value), PayloadError> {
    if payload.len() < 4 {
        return Err(PayloadError::MissingPrefix);
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&payload[..4]);
    let n = u32::from_le_bytes(prefix) as usize;
    let rest = &payload[4..];
    if rest.len() < n {
        return Err(PayloadError::Truncated {
            expected: n,
            got: rest.len(),
        });
    }
    let ciphertext = rest[..n].to_vec();
    let json = serde_json::from_slice(&rest[n..])?;
    Ok((ciphertext, json))
}

/// Inverse of [`parse_combined_payload`].
pub fn emit_combined_payload(ciphertext: &[u8], json: &Value) -> Vec<u8> {
    let meta = serde_json::to_vec(json).expect("serializing a Value cannot fail");
    let mut out = Vec::with_capacity(4 + ciphertext.len() + meta.len());
    out.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(&meta);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_emit_roundtrip() {
        let json = json!({"ephemeral_key": "aa", "enc_type": "aes-gcm"});
        let ciphertext = vec![1u8, 2, 3, 4, 5];
        let wire = emit_combined_payload(&ciphertext, &json);
        let (ct, meta) = parse_combined_payload(&wire).unwrap();
        assert_eq!(ct, ciphertext);
        assert_eq!(meta, json);
    }

    #[test]
    fn test_parse_empty_ciphertext() {
        let wire = emit_combined_payload(b"", &json!({"headers": ""}));
        let (ct, meta) = parse_combined_payload(&wire).unwrap();
        assert!(ct.is_empty());
        assert_eq!(meta["headers"], "");
    }

    #[test]
    fn test_parse_too_short_for_prefix() {
        assert!(matches!(
            parse_combined_payload(&[1, 2, 3]),
            Err(PayloadError::MissingPrefix)
        ));
    }

    #[test]
    fn test_parse_length_exceeds_buffer() {
        let mut wire = 100u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"short");
        assert!(matches!(
            parse_combined_payload(&wire),
            Err(PayloadError::Truncated { expected: 100, got: 5 })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_trailing_json() {
        let mut wire = 2u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"cc{not json");
        assert!(matches!(
            parse_combined_payload(&wire),
            Err(PayloadError::BadJson(_))
        ));
    }

    #[test]
    fn test_binary_ciphertext_preserved() {
        let ciphertext: Vec<u8> = (0u8..=255).collect();
        let wire = emit_combined_payload(&ciphertext, &json!({}));
        let (ct, _) = parse_combined_payload(&wire).unwrap();
        assert_eq!(ct, ciphertext);
    }
}
