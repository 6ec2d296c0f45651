//! Encryption envelopes.
//!
//! An envelope is self-describing: decrypting it needs only the envelope and
//! a fresh fetch of the key it names.

use base64::{engine::general_purpose::STANDARD, Engine};
use quantum_kme::KeyId;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::level::SecurityLevel;
use crate::wire::{self, MAX_KEY_ID_BYTES, NONCE_BYTES, PROTOCOL_VERSION, TAG_BYTES};

/// Level-specific framing parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LevelParams {
    Otp { plaintext_len: usize },
    SeededStream,
    Hybrid { kem_ciphertext_len: usize },
    Plain,
}

impl LevelParams {
    pub fn level(&self) -> SecurityLevel {
        match self {
            Self::Otp { .. } => SecurityLevel::Otp,
            Self::SeededStream => SecurityLevel::SeededStream,
            Self::Hybrid { .. } => SecurityLevel::HybridSimulated,
            Self::Plain => SecurityLevel::Plain,
        }
    }
}

/// Ciphertext plus everything needed to decrypt it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "EnvelopeJson", try_from = "EnvelopeJson")]
pub struct EncryptionEnvelope {
    /// Key the body was produced under (`None` at the plain level).
    pub key_id: Option<KeyId>,
    pub params: LevelParams,
    /// Level-specific framing, see [`wire`](crate::wire).
    pub body: Vec<u8>,
}

impl EncryptionEnvelope {
    pub fn level(&self) -> SecurityLevel {
        self.params.level()
    }

    /// Check that the body framing agrees with the level parameters.
    pub fn validate(&self) -> Result<(), EngineError> {
        let min_body = match &self.params {
            LevelParams::Otp { plaintext_len } => {
                if self.body.len() != plaintext_len.saturating_add(TAG_BYTES) {
                    return Err(EngineError::MalformedEnvelope("otp body length"));
                }
                0
            }
            LevelParams::SeededStream => NONCE_BYTES + TAG_BYTES,
            LevelParams::Hybrid { kem_ciphertext_len } => {
                NONCE_BYTES.saturating_add(*kem_ciphertext_len).saturating_add(TAG_BYTES)
            }
            LevelParams::Plain => 0,
        };
        if self.body.len() < min_body {
            return Err(EngineError::MalformedEnvelope("body too short"));
        }
        match (&self.params, &self.key_id) {
            (LevelParams::Plain, Some(_)) => Err(EngineError::MalformedEnvelope("plain envelope names a key")),
            (LevelParams::Plain, None) => Ok(()),
            (_, None) => Err(EngineError::MalformedEnvelope("missing key id")),
            (_, Some(id)) if id.as_str().is_empty() || id.as_str().len() > MAX_KEY_ID_BYTES => {
                Err(EngineError::MalformedEnvelope("key id length"))
            }
            (_, Some(_)) => Ok(()),
        }
    }

    /// Split the body into its authenticated regions.
    pub(crate) fn sections(&self) -> Result<Sections<'_>, EngineError> {
        self.validate()?;
        let body = self.body.as_slice();
        let (nonce, rest) = match self.params {
            LevelParams::SeededStream | LevelParams::Hybrid { .. } => body.split_at(NONCE_BYTES),
            _ => (&body[..0], body),
        };
        let (kem_ciphertext, rest) = match self.params {
            LevelParams::Hybrid { kem_ciphertext_len } => rest.split_at(kem_ciphertext_len),
            _ => (&rest[..0], rest),
        };
        let (ciphertext, tag) = if self.level().is_authenticated() {
            rest.split_at(rest.len() - TAG_BYTES)
        } else {
            (rest, &rest[rest.len()..])
        };
        Ok(Sections { nonce, kem_ciphertext, ciphertext, tag })
    }

    /// Binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        wire::encode_envelope(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, EngineError> {
        wire::decode_envelope(data)
    }

    /// JSON form, body in base64.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|_| EngineError::MalformedEnvelope("json encode"))
    }

    pub fn from_json(s: &str) -> Result<Self, EngineError> {
        serde_json::from_str(s).map_err(|_| EngineError::MalformedEnvelope("json"))
    }
}

pub(crate) struct Sections<'a> {
    pub nonce: &'a [u8],
    pub kem_ciphertext: &'a [u8],
    pub ciphertext: &'a [u8],
    pub tag: &'a [u8],
}

// ---------------------------------------------------------------------------
// JSON representation
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct EnvelopeJson {
    version: u8,
    level: SecurityLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_id: Option<KeyId>,
    params: LevelParams,
    body: String,
}

impl From<EncryptionEnvelope> for EnvelopeJson {
    fn from(env: EncryptionEnvelope) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            level: env.level(),
            key_id: env.key_id,
            body: STANDARD.encode(&env.body),
            params: env.params,
        }
    }
}

impl TryFrom<EnvelopeJson> for EncryptionEnvelope {
    type Error = EngineError;

    fn try_from(json: EnvelopeJson) -> Result<Self, Self::Error> {
        if json.version != PROTOCOL_VERSION {
            return Err(EngineError::MalformedEnvelope("version"));
        }
        if json.level != json.params.level() {
            return Err(EngineError::MalformedEnvelope("level does not match params"));
        }
        let body = STANDARD
            .decode(json.body.as_bytes())
            .map_err(|_| EngineError::MalformedEnvelope("body base64"))?;
        let env = EncryptionEnvelope { key_id: json.key_id, params: json.params, body };
        env.validate()?;
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_envelope() -> EncryptionEnvelope {
        EncryptionEnvelope {
            key_id: Some(KeyId::new("abc")),
            params: LevelParams::SeededStream,
            body: vec![0u8; NONCE_BYTES + 5 + TAG_BYTES],
        }
    }

    #[test]
    fn json_shape() {
        let json = stream_envelope().to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["level"], 2);
        assert_eq!(v["key_id"], "abc");
        assert_eq!(v["params"]["kind"], "seeded_stream");
        assert!(v["body"].is_string());
        assert_eq!(EncryptionEnvelope::from_json(&json).unwrap(), stream_envelope());
    }

    #[test]
    fn json_level_mismatch_rejected() {
        let json = stream_envelope().to_json().unwrap().replace("\"level\":2", "\"level\":3");
        assert!(EncryptionEnvelope::from_json(&json).is_err());
    }

    #[test]
    fn sections_split_hybrid_body() {
        let env = EncryptionEnvelope {
            key_id: Some(KeyId::new("k")),
            params: LevelParams::Hybrid { kem_ciphertext_len: 4 },
            body: (0..(NONCE_BYTES + 4 + 3 + TAG_BYTES) as u8).collect(),
        };
        let s = env.sections().unwrap();
        assert_eq!(s.nonce.len(), NONCE_BYTES);
        assert_eq!(s.kem_ciphertext, &[16, 17, 18, 19]);
        assert_eq!(s.ciphertext, &[20, 21, 22]);
        assert_eq!(s.tag.len(), TAG_BYTES);
    }

    #[test]
    fn validate_catches_inconsistent_framing() {
        let mut env = stream_envelope();
        env.body.truncate(NONCE_BYTES + TAG_BYTES - 1);
        assert!(env.validate().is_err());

        let env = EncryptionEnvelope {
            key_id: Some(KeyId::new("k")),
            params: LevelParams::Otp { plaintext_len: 10 },
            body: vec![0; 10 + TAG_BYTES + 1],
        };
        assert!(env.validate().is_err());

        let env = EncryptionEnvelope { key_id: None, params: LevelParams::SeededStream, body: vec![0; 64] };
        assert!(env.validate().is_err());
    }
}
