//! Tiered encryption engine.
//!
//! Every level draws its key material from the key service, reports how much
//! of it was consumed, and frames the result as an [`EncryptionEnvelope`].

use std::sync::Arc;

use quantum_kme::{KeyDelivery, KeyId, KeyMaterial, KeyService, KmeError};
use rand_core::{OsRng, RngCore};

use crate::envelope::{EncryptionEnvelope, LevelParams};
use crate::error::EngineError;
use crate::kdf::{self, CTX_HYBRID_STREAM, CTX_SEEDED_STREAM};
use crate::kem::{KemProvider, SimulatedKem};
use crate::level::SecurityLevel;
use crate::stream;
use crate::wire::{NONCE_BYTES, OTP_AUTH_KEY_BYTES, STREAM_SEED_BYTES, TAG_BYTES};

// ---------------------------------------------------------------------------
// Decrypt result
// ---------------------------------------------------------------------------

/// Result of a decrypt.
///
/// A tag mismatch is reported here rather than as an error; the plaintext is
/// withheld whenever `verified` is false.
#[derive(Debug)]
pub struct DecryptOutcome {
    pub plaintext: Option<Vec<u8>>,
    pub verified: bool,
    /// The caller must erase its stored copy of the envelope and then call
    /// [`CryptoEngine::finalize_view_once`].
    pub purge_required: bool,
}

impl DecryptOutcome {
    fn verified(plaintext: Vec<u8>, purge_required: bool) -> Self {
        Self { plaintext: Some(plaintext), verified: true, purge_required }
    }

    fn rejected() -> Self {
        Self { plaintext: None, verified: false, purge_required: false }
    }

    /// The plaintext, or `AuthenticationFailed` if the tag did not verify.
    pub fn into_verified(self) -> Result<Vec<u8>, EngineError> {
        match (self.verified, self.plaintext) {
            (true, Some(pt)) => Ok(pt),
            _ => Err(EngineError::AuthenticationFailed),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct CryptoEngine {
    kme: Arc<KeyService>,
    kem: Box<dyn KemProvider>,
}

impl CryptoEngine {
    /// Engine using the simulated KEM for the hybrid level.
    pub fn new(kme: Arc<KeyService>) -> Self {
        Self::with_kem(kme, Box::new(SimulatedKem))
    }

    pub fn with_kem(kme: Arc<KeyService>, kem: Box<dyn KemProvider>) -> Self {
        Self { kme, kem }
    }

    pub fn key_service(&self) -> &Arc<KeyService> {
        &self.kme
    }

    /// Key material a payload of `payload_len` bytes draws at `level`.
    pub fn key_bytes_for(&self, level: SecurityLevel, payload_len: usize) -> usize {
        match level {
            SecurityLevel::Otp => payload_len.saturating_add(OTP_AUTH_KEY_BYTES),
            SecurityLevel::SeededStream => STREAM_SEED_BYTES,
            SecurityLevel::HybridSimulated => self.kem.seed_bytes(),
            SecurityLevel::Plain => 0,
        }
    }

    pub fn encrypt(
        &self,
        payload: &[u8],
        level: SecurityLevel,
        recipient: Option<&str>,
    ) -> Result<EncryptionEnvelope, EngineError> {
        self.encrypt_for_message(payload, level, recipient, None)
    }

    /// Encrypt and attribute the key consumption to `message_id` in the audit trail.
    ///
    /// Never falls back to another level: if key material cannot be obtained
    /// the call fails.
    pub fn encrypt_for_message(
        &self,
        payload: &[u8],
        level: SecurityLevel,
        recipient: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<EncryptionEnvelope, EngineError> {
        if level == SecurityLevel::Plain {
            return Ok(EncryptionEnvelope {
                key_id: None,
                params: LevelParams::Plain,
                body: payload.to_vec(),
            });
        }

        let key_bytes = self.key_bytes_for(level, payload.len());
        let bits = key_bytes
            .checked_mul(8)
            .ok_or(EngineError::CapacityExceeded {
                requested_bits: usize::MAX,
                max_bits: self.kme.config().max_key_bits,
            })?;
        let delivery = self.kme.request_key(bits, recipient)?;

        match self.seal_with_key(&delivery, payload, level, key_bytes, message_id) {
            Ok(envelope) => {
                tracing::debug!(
                    level = %level,
                    key_id = %delivery.key_id,
                    payload_len = payload.len(),
                    consumed = key_bytes,
                    "payload encrypted"
                );
                Ok(envelope)
            }
            Err(e) => {
                // Nothing will ever be decrypted under this key.
                if let Err(destroy) = self.kme.destroy_key(&delivery.key_id) {
                    tracing::warn!(key_id = %delivery.key_id, error = %destroy, "orphaned key not destroyed");
                }
                Err(e)
            }
        }
    }

    fn seal_with_key(
        &self,
        delivery: &KeyDelivery,
        payload: &[u8],
        level: SecurityLevel,
        key_bytes: usize,
        message_id: Option<&str>,
    ) -> Result<EncryptionEnvelope, EngineError> {
        let key = self.kme.fetch_key(&delivery.key_id)?;
        if key.len() != key_bytes {
            return Err(EngineError::KeyService(KmeError::StorageError(format!(
                "key {} holds {} bytes, {} requested",
                delivery.key_id,
                key.len(),
                key_bytes
            ))));
        }

        let (params, body) = match level {
            SecurityLevel::Otp => seal_otp(&key, payload),
            SecurityLevel::SeededStream => seal_stream(&key, payload),
            SecurityLevel::HybridSimulated => self.seal_hybrid(&key, payload)?,
            SecurityLevel::Plain => (LevelParams::Plain, payload.to_vec()),
        };

        self.kme.acknowledge_usage(&delivery.key_id, key_bytes, message_id)?;

        Ok(EncryptionEnvelope { key_id: Some(delivery.key_id.clone()), params, body })
    }

    fn seal_hybrid(&self, key: &KeyMaterial, payload: &[u8]) -> Result<(LevelParams, Vec<u8>), EngineError> {
        let encap = self.kem.encapsulate(key.as_bytes())?;
        let keys = kdf::stream_keys(encap.shared_secret.as_slice(), CTX_HYBRID_STREAM);

        let kem_len = encap.kem_ciphertext.len();
        let mut body = Vec::with_capacity(NONCE_BYTES + kem_len + payload.len() + TAG_BYTES);
        body.extend_from_slice(&encap.nonce);
        body.extend_from_slice(&encap.kem_ciphertext);
        let ct_start = body.len();
        body.extend_from_slice(payload);
        stream::apply_keystream(&keys.enc, &encap.nonce, &mut body[ct_start..]);
        let tag = stream::tag(&keys.mac, &[body.as_slice()]);
        body.extend_from_slice(&tag);

        Ok((LevelParams::Hybrid { kem_ciphertext_len: kem_len }, body))
    }

    // -----------------------------------------------------------------------
    // Decrypt
    // -----------------------------------------------------------------------

    /// Decrypt an envelope. The key is re-fetched from the key service by id.
    pub fn decrypt(&self, envelope: &EncryptionEnvelope) -> Result<DecryptOutcome, EngineError> {
        let sections = envelope.sections()?;
        let level = envelope.level();

        let Some(key_id) = envelope.key_id.as_ref() else {
            return Ok(DecryptOutcome::verified(envelope.body.clone(), false));
        };
        let key = self.kme.retrieve_for_decrypt(key_id)?;

        let opened = match level {
            SecurityLevel::Otp => {
                let pad = key.as_bytes();
                let data_len = sections.ciphertext.len();
                if pad.len() != data_len + OTP_AUTH_KEY_BYTES {
                    return Err(EngineError::MalformedEnvelope("pad length does not match envelope"));
                }
                let (pad, auth_key) = pad.split_at(data_len);
                if stream::verify_tag(auth_key, &[sections.ciphertext], sections.tag) {
                    let mut pt = sections.ciphertext.to_vec();
                    stream::xor_in_place(&mut pt, pad);
                    Some(pt)
                } else {
                    None
                }
            }
            SecurityLevel::SeededStream => {
                if key.len() != STREAM_SEED_BYTES {
                    return Err(EngineError::MalformedEnvelope("seed length does not match envelope"));
                }
                let keys = kdf::stream_keys(key.as_bytes(), CTX_SEEDED_STREAM);
                open_stream(&keys, &sections, &[sections.nonce, sections.ciphertext])
            }
            SecurityLevel::HybridSimulated => {
                let shared = self.kem.decapsulate(key.as_bytes(), sections.kem_ciphertext)?;
                let keys = kdf::stream_keys(shared.as_slice(), CTX_HYBRID_STREAM);
                open_stream(
                    &keys,
                    &sections,
                    &[sections.nonce, sections.kem_ciphertext, sections.ciphertext],
                )
            }
            SecurityLevel::Plain => Some(sections.ciphertext.to_vec()),
        };

        match opened {
            Some(pt) => {
                tracing::debug!(level = %level, key_id = %key_id, "envelope decrypted");
                Ok(DecryptOutcome::verified(pt, level.is_view_once()))
            }
            None => {
                tracing::warn!(level = %level, key_id = %key_id, "envelope failed authentication");
                Ok(DecryptOutcome::rejected())
            }
        }
    }

    /// Destroy the key of a view-once envelope after the caller has purged it.
    ///
    /// No-op for levels that are not view-once.
    pub fn finalize_view_once(&self, envelope: &EncryptionEnvelope) -> Result<(), EngineError> {
        if !envelope.level().is_view_once() {
            return Ok(());
        }
        let key_id = envelope
            .key_id
            .as_ref()
            .ok_or(EngineError::MalformedEnvelope("missing key id"))?;
        self.kme.destroy_key(key_id)?;
        tracing::info!(key_id = %key_id, "view-once key destroyed");
        Ok(())
    }

    /// Destroy the key behind an envelope regardless of level.
    pub fn discard(&self, key_id: &KeyId) -> Result<(), EngineError> {
        Ok(self.kme.destroy_key(key_id)?)
    }
}

// ---------------------------------------------------------------------------
// Level 1 and 2 sealing
// ---------------------------------------------------------------------------

/// ct = payload XOR pad[..n]; tag = HMAC(pad[n..n+32], ct)
fn seal_otp(key: &KeyMaterial, payload: &[u8]) -> (LevelParams, Vec<u8>) {
    let (pad, auth_key) = key.as_bytes().split_at(payload.len());
    let mut body = Vec::with_capacity(payload.len() + TAG_BYTES);
    body.extend_from_slice(payload);
    stream::xor_in_place(&mut body, pad);
    let tag = stream::tag(auth_key, &[body.as_slice()]);
    body.extend_from_slice(&tag);
    (LevelParams::Otp { plaintext_len: payload.len() }, body)
}

fn seal_stream(key: &KeyMaterial, payload: &[u8]) -> (LevelParams, Vec<u8>) {
    let keys = kdf::stream_keys(key.as_bytes(), CTX_SEEDED_STREAM);
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);

    let mut body = Vec::with_capacity(NONCE_BYTES + payload.len() + TAG_BYTES);
    body.extend_from_slice(&nonce);
    body.extend_from_slice(payload);
    stream::apply_keystream(&keys.enc, &nonce, &mut body[NONCE_BYTES..]);
    let tag = stream::tag(&keys.mac, &[body.as_slice()]);
    body.extend_from_slice(&tag);
    (LevelParams::SeededStream, body)
}

/// Verify first, then reverse the keystream.
fn open_stream(
    keys: &kdf::StreamKeys,
    sections: &crate::envelope::Sections<'_>,
    authenticated: &[&[u8]],
) -> Option<Vec<u8>> {
    if !stream::verify_tag(&keys.mac, authenticated, sections.tag) {
        return None;
    }
    let nonce: &[u8; NONCE_BYTES] = sections.nonce.try_into().ok()?;
    let mut pt = sections.ciphertext.to_vec();
    stream::apply_keystream(&keys.enc, nonce, &mut pt);
    Some(pt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantum_kme::{
        EntryUpdate, InMemoryAuditSink, InMemoryBackend, KeyEntry, KeyState, SecretBytes,
        StorageBackend,
    };

    fn engine() -> CryptoEngine {
        let kme = KeyService::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryAuditSink::new()),
        );
        CryptoEngine::new(Arc::new(kme))
    }

    /// Hands out one byte less material than was stored.
    struct ShortReads(InMemoryBackend);

    impl StorageBackend for ShortReads {
        fn insert(&self, entry: KeyEntry) -> Result<(), KmeError> {
            self.0.insert(entry)
        }
        fn get(&self, id: &KeyId) -> Result<Option<KeyEntry>, KmeError> {
            Ok(self.0.get(id)?.map(|mut e| {
                let bytes = e.material.as_bytes();
                e.material = SecretBytes::new(bytes[..bytes.len().saturating_sub(1)].to_vec());
                e
            }))
        }
        fn update(
            &self,
            id: &KeyId,
            f: EntryUpdate<'_>,
        ) -> Result<Option<KeyEntry>, KmeError> {
            self.0.update(id, f)
        }
        fn remove(&self, id: &KeyId) -> Result<(), KmeError> {
            self.0.remove(id)
        }
        fn list(&self) -> Result<Vec<KeyEntry>, KmeError> {
            self.0.list()
        }
    }

    #[test]
    fn short_key_is_a_key_service_error() {
        let kme = Arc::new(KeyService::new(
            Arc::new(ShortReads(InMemoryBackend::new())),
            Arc::new(InMemoryAuditSink::new()),
        ));
        let engine = CryptoEngine::new(kme.clone());

        let err = engine.encrypt(b"payload", SecurityLevel::SeededStream, None).unwrap_err();
        assert!(matches!(err, EngineError::KeyService(KmeError::StorageError(_))), "{:?}", err);

        // The short key is destroyed, not left active.
        let entries = kme.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, KeyState::Destroyed);
    }

    #[test]
    fn consumption_matches_level() {
        let engine = engine();
        let payload = [7u8; 100];
        for (level, expected) in [
            (SecurityLevel::Otp, 132),
            (SecurityLevel::SeededStream, 32),
            (SecurityLevel::HybridSimulated, 96),
        ] {
            let env = engine.encrypt(&payload, level, None).unwrap();
            let entry = engine
                .key_service()
                .entry(env.key_id.as_ref().unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(entry.consumed_bytes, expected, "{}", level);
            assert_eq!(entry.state, KeyState::Exhausted);
        }
    }

    #[test]
    fn plain_draws_no_key() {
        let engine = engine();
        let env = engine.encrypt(b"hi", SecurityLevel::Plain, None).unwrap();
        assert!(env.key_id.is_none());
        assert_eq!(env.body, b"hi");
        assert!(engine.key_service().entries().unwrap().is_empty());
        let out = engine.decrypt(&env).unwrap();
        assert!(out.verified);
        assert!(!out.purge_required);
    }

    #[test]
    fn otp_ciphertext_differs_from_plaintext() {
        let engine = engine();
        let pt = [0u8; 64];
        let env = engine.encrypt(&pt, SecurityLevel::Otp, None).unwrap();
        assert_eq!(env.body.len(), 64 + TAG_BYTES);
        assert_ne!(&env.body[..64], &pt[..]);
    }

    #[test]
    fn oversized_otp_is_capacity_exceeded() {
        let engine = engine();
        let max = engine.key_service().config().max_key_bytes();
        let payload = vec![0u8; max];
        assert!(matches!(
            engine.encrypt(&payload, SecurityLevel::Otp, None),
            Err(EngineError::CapacityExceeded { .. })
        ));
        assert!(engine.key_service().entries().unwrap().is_empty());
    }

    #[test]
    fn view_once_lifecycle() {
        let engine = engine();
        let env = engine.encrypt(b"read me once", SecurityLevel::Otp, Some("bob")).unwrap();

        let out = engine.decrypt(&env).unwrap();
        assert!(out.purge_required);
        assert_eq!(out.into_verified().unwrap(), b"read me once");

        engine.finalize_view_once(&env).unwrap();
        assert!(matches!(engine.decrypt(&env), Err(EngineError::KeyDestroyed)));
    }

    #[test]
    fn stream_levels_are_not_view_once() {
        let engine = engine();
        let env = engine.encrypt(b"again", SecurityLevel::SeededStream, None).unwrap();
        assert!(!engine.decrypt(&env).unwrap().purge_required);
        engine.finalize_view_once(&env).unwrap();
        // Still readable.
        assert!(engine.decrypt(&env).unwrap().verified);
    }

    #[test]
    fn unknown_key_is_unavailable() {
        let engine = engine();
        let mut env = engine.encrypt(b"x", SecurityLevel::SeededStream, None).unwrap();
        env.key_id = Some(KeyId::new("ffffffffffffffffffffffffffffffff"));
        assert!(matches!(
            engine.decrypt(&env),
            Err(EngineError::KeyUnavailable { reason: quantum_kme::Unavailable::Unknown })
        ));
    }

    #[test]
    fn rejected_outcome_withholds_plaintext() {
        let engine = engine();
        let mut env = engine.encrypt(b"secret", SecurityLevel::Otp, None).unwrap();
        env.body[0] ^= 0x80;
        let out = engine.decrypt(&env).unwrap();
        assert!(!out.verified);
        assert!(out.plaintext.is_none());
        assert!(!out.purge_required);
        assert!(matches!(out.into_verified(), Err(EngineError::AuthenticationFailed)));
    }
}
