//! Wire format (v1)
//!
//! Binary envelope, all integers big-endian:
//!   version[1] || level[1] || key_id_len[2] || key_id[..]
//!   || params_len[2] || params[..] || body_len[4] || body[..]
//!
//! params by level:
//!   1 (otp)            plaintext_len[8]
//!   2 (seeded stream)  (empty)
//!   3 (hybrid)         kem_ciphertext_len[4]
//!   4 (plain)          (empty)
//!
//! body by level:
//!   1  ciphertext[plaintext_len] || tag[32]
//!   2  nonce[16] || ciphertext || tag[32]
//!   3  nonce[16] || kem_ct[kem_ciphertext_len] || ciphertext || tag[32]
//!   4  plaintext

use crate::envelope::{EncryptionEnvelope, LevelParams};
use crate::error::EngineError;
use crate::level::SecurityLevel;
use quantum_kme::KeyId;

/// Protocol identifier for KDF domain separation
pub const PROTOCOL_ID: &[u8] = b"quantum-env-v1";

/// Version byte for v1
pub const PROTOCOL_VERSION: u8 = 0x01;

// ---------------------------------------------------------------------------
// Component sizes
// ---------------------------------------------------------------------------

pub const NONCE_BYTES: usize = 16;
pub const TAG_BYTES: usize = 32;

/// Level 1 authentication subkey, taken from the pad after the data region.
pub const OTP_AUTH_KEY_BYTES: usize = 32;

/// Level 2 seed drawn from the key service.
pub const STREAM_SEED_BYTES: usize = 32;

pub const MAX_KEY_ID_BYTES: usize = 128;

/// version + level + key_id_len + params_len + body_len
pub const HEADER_BYTES: usize = 1 + 1 + 2 + 2 + 4; // 10

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode_envelope(envelope: &EncryptionEnvelope) -> Vec<u8> {
    let key_id = envelope.key_id.as_ref().map(|k| k.as_str().as_bytes()).unwrap_or_default();
    let params = encode_params(&envelope.params);

    let mut out =
        Vec::with_capacity(HEADER_BYTES + key_id.len() + params.len() + envelope.body.len());
    out.push(PROTOCOL_VERSION);
    out.push(envelope.level().tag());
    out.extend_from_slice(&(key_id.len() as u16).to_be_bytes());
    out.extend_from_slice(key_id);
    out.extend_from_slice(&(params.len() as u16).to_be_bytes());
    out.extend_from_slice(&params);
    out.extend_from_slice(&(envelope.body.len() as u32).to_be_bytes());
    out.extend_from_slice(&envelope.body);
    out
}

fn encode_params(params: &LevelParams) -> Vec<u8> {
    match params {
        LevelParams::Otp { plaintext_len } => (*plaintext_len as u64).to_be_bytes().to_vec(),
        LevelParams::Hybrid { kem_ciphertext_len } => {
            (*kem_ciphertext_len as u32).to_be_bytes().to_vec()
        }
        LevelParams::SeededStream | LevelParams::Plain => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], EngineError> {
        if self.data.len() < n {
            return Err(EngineError::MalformedEnvelope(what));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, EngineError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<usize, EngineError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
    }

    fn u32(&mut self, what: &'static str) -> Result<usize, EngineError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }
}

pub fn decode_envelope(data: &[u8]) -> Result<EncryptionEnvelope, EngineError> {
    let mut r = Reader { data };

    if r.u8("version")? != PROTOCOL_VERSION {
        return Err(EngineError::MalformedEnvelope("version"));
    }
    let level = SecurityLevel::try_from(r.u8("level")?)?;

    let key_id_len = r.u16("key id length")?;
    if key_id_len > MAX_KEY_ID_BYTES {
        return Err(EngineError::MalformedEnvelope("key id length"));
    }
    let key_id = r.take(key_id_len, "key id")?;
    let key_id = if key_id.is_empty() {
        None
    } else {
        let s = core::str::from_utf8(key_id).map_err(|_| EngineError::MalformedEnvelope("key id"))?;
        Some(KeyId::new(s))
    };

    let params_len = r.u16("params length")?;
    let params = decode_params(level, r.take(params_len, "params")?)?;

    let body_len = r.u32("body length")?;
    let body = r.take(body_len, "body")?.to_vec();
    if !r.data.is_empty() {
        return Err(EngineError::MalformedEnvelope("trailing bytes"));
    }

    let envelope = EncryptionEnvelope { key_id, params, body };
    envelope.validate()?;
    Ok(envelope)
}

fn decode_params(level: SecurityLevel, raw: &[u8]) -> Result<LevelParams, EngineError> {
    let bad = || EngineError::MalformedEnvelope("params");
    match level {
        SecurityLevel::Otp => {
            let b: [u8; 8] = raw.try_into().map_err(|_| bad())?;
            let len = usize::try_from(u64::from_be_bytes(b)).map_err(|_| bad())?;
            Ok(LevelParams::Otp { plaintext_len: len })
        }
        SecurityLevel::SeededStream if raw.is_empty() => Ok(LevelParams::SeededStream),
        SecurityLevel::HybridSimulated => {
            let b: [u8; 4] = raw.try_into().map_err(|_| bad())?;
            Ok(LevelParams::Hybrid { kem_ciphertext_len: u32::from_be_bytes(b) as usize })
        }
        SecurityLevel::Plain if raw.is_empty() => Ok(LevelParams::Plain),
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otp_envelope() -> EncryptionEnvelope {
        EncryptionEnvelope {
            key_id: Some(KeyId::new("00112233445566778899aabbccddeeff")),
            params: LevelParams::Otp { plaintext_len: 3 },
            body: vec![1, 2, 3].into_iter().chain([0xaa; TAG_BYTES]).collect(),
        }
    }

    #[test]
    fn encode_decode() {
        let env = otp_envelope();
        let bytes = encode_envelope(&env);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 1);
        assert_eq!(decode_envelope(&bytes).unwrap(), env);
    }

    #[test]
    fn truncation_rejected_at_every_length() {
        let bytes = encode_envelope(&otp_envelope());
        for n in 0..bytes.len() {
            assert!(
                matches!(decode_envelope(&bytes[..n]), Err(EngineError::MalformedEnvelope(_))),
                "prefix of {} bytes accepted",
                n
            );
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_envelope(&otp_envelope());
        bytes.push(0);
        assert!(decode_envelope(&bytes).is_err());
    }

    #[test]
    fn bad_version_and_level() {
        let mut bytes = encode_envelope(&otp_envelope());
        bytes[0] = 2;
        assert!(matches!(decode_envelope(&bytes), Err(EngineError::MalformedEnvelope("version"))));

        let mut bytes = encode_envelope(&otp_envelope());
        bytes[1] = 7;
        assert!(matches!(decode_envelope(&bytes), Err(EngineError::UnsupportedLevel(7))));
    }

    #[test]
    fn plain_has_no_key() {
        let env = EncryptionEnvelope {
            key_id: None,
            params: LevelParams::Plain,
            body: b"hello".to_vec(),
        };
        let bytes = encode_envelope(&env);
        assert_eq!(bytes.len(), HEADER_BYTES + 5);
        assert_eq!(decode_envelope(&bytes).unwrap(), env);
    }
}
