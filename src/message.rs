//! Messages with attachments.
//!
//! The body and every attachment are sealed as independent payloads, each
//! under its own key. At the one-time-pad level this means every attachment
//! draws a pad the size of itself.

use serde::{Deserialize, Serialize};

use crate::engine::CryptoEngine;
use crate::envelope::EncryptionEnvelope;
use crate::error::EngineError;
use crate::level::SecurityLevel;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedAttachment {
    pub name: String,
    pub envelope: EncryptionEnvelope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub body: EncryptionEnvelope,
    pub attachments: Vec<SealedAttachment>,
}

impl SealedMessage {
    pub fn level(&self) -> SecurityLevel {
        self.body.level()
    }

    fn envelopes(&self) -> impl Iterator<Item = &EncryptionEnvelope> {
        std::iter::once(&self.body).chain(self.attachments.iter().map(|a| &a.envelope))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageContent {
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
}

/// Result of opening a message. Content is only present if every part verified.
#[derive(Debug)]
pub struct OpenedMessage {
    pub content: Option<MessageContent>,
    pub verified: bool,
    pub purge_required: bool,
}

impl CryptoEngine {
    /// Seal a body and its attachments at `level`.
    ///
    /// All-or-nothing: if any part fails, keys issued for the parts already
    /// sealed are destroyed and the error is returned.
    pub fn seal_message(
        &self,
        body: &[u8],
        attachments: &[Attachment],
        level: SecurityLevel,
        recipient: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<SealedMessage, EngineError> {
        let body = self.encrypt_for_message(body, level, recipient, message_id)?;
        let mut sealed = SealedMessage { body, attachments: Vec::with_capacity(attachments.len()) };

        for attachment in attachments {
            match self.encrypt_for_message(&attachment.data, level, recipient, message_id) {
                Ok(envelope) => sealed.attachments.push(SealedAttachment {
                    name: attachment.name.clone(),
                    envelope,
                }),
                Err(e) => {
                    tracing::warn!(
                        attachment = %attachment.name,
                        error = %e,
                        "attachment sealing failed; discarding message keys"
                    );
                    self.discard_message_keys(&sealed);
                    return Err(e);
                }
            }
        }

        tracing::debug!(level = %level, attachments = attachments.len(), "message sealed");
        Ok(sealed)
    }

    /// Open every part of a message.
    ///
    /// A missing or destroyed key on any part is an error. A tag failure on
    /// any part withholds the whole message.
    pub fn open_message(&self, sealed: &SealedMessage) -> Result<OpenedMessage, EngineError> {
        let body = self.decrypt(&sealed.body)?;
        let mut verified = body.verified;
        let mut purge_required = body.purge_required;

        let mut attachments = Vec::with_capacity(sealed.attachments.len());
        for part in &sealed.attachments {
            let out = self.decrypt(&part.envelope)?;
            verified &= out.verified;
            purge_required |= out.purge_required;
            attachments.push((part.name.clone(), out.plaintext));
        }

        if !verified {
            return Ok(OpenedMessage { content: None, verified: false, purge_required: false });
        }

        let content = MessageContent {
            body: body.plaintext.unwrap_or_default(),
            attachments: attachments
                .into_iter()
                .map(|(name, data)| Attachment { name, data: data.unwrap_or_default() })
                .collect(),
        };
        Ok(OpenedMessage { content: Some(content), verified: true, purge_required })
    }

    /// Destroy the keys of every view-once part of a message.
    pub fn finalize_message_view_once(&self, sealed: &SealedMessage) -> Result<(), EngineError> {
        for envelope in sealed.envelopes() {
            self.finalize_view_once(envelope)?;
        }
        Ok(())
    }

    fn discard_message_keys(&self, sealed: &SealedMessage) {
        for key_id in sealed.envelopes().filter_map(|e| e.key_id.as_ref()) {
            if let Err(e) = self.discard(key_id) {
                tracing::warn!(key_id = %key_id, error = %e, "failed to discard message key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantum_kme::{InMemoryAuditSink, InMemoryBackend, KeyService, KeyState, KmeConfig};
    use std::sync::Arc;

    fn engine_with(config: KmeConfig) -> CryptoEngine {
        let kme = KeyService::with_config(
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryAuditSink::new()),
            config,
        );
        CryptoEngine::new(Arc::new(kme))
    }

    fn attachments() -> Vec<Attachment> {
        vec![
            Attachment { name: "a.txt".into(), data: b"first attachment".to_vec() },
            Attachment { name: "b.bin".into(), data: vec![0xfe; 300] },
        ]
    }

    #[test]
    fn every_part_gets_its_own_key() {
        let engine = engine_with(KmeConfig::default());
        let sealed = engine
            .seal_message(b"hello", &attachments(), SecurityLevel::Otp, Some("bob"), Some("msg-1"))
            .unwrap();

        let ids: Vec<_> = sealed.envelopes().map(|e| e.key_id.clone().unwrap()).collect();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);

        // Each pad is sized to its own part.
        let kme = engine.key_service();
        assert_eq!(kme.entry(&ids[0]).unwrap().unwrap().length_bytes, 5 + 32);
        assert_eq!(kme.entry(&ids[2]).unwrap().unwrap().length_bytes, 300 + 32);

        let opened = engine.open_message(&sealed).unwrap();
        assert!(opened.verified);
        assert!(opened.purge_required);
        let content = opened.content.unwrap();
        assert_eq!(content.body, b"hello");
        assert_eq!(content.attachments, attachments());

        engine.finalize_message_view_once(&sealed).unwrap();
        for id in &ids {
            assert_eq!(kme.entry(id).unwrap().unwrap().state, KeyState::Destroyed);
        }
        assert!(matches!(engine.open_message(&sealed), Err(EngineError::KeyDestroyed)));
    }

    #[test]
    fn tampered_attachment_withholds_everything() {
        let engine = engine_with(KmeConfig::default());
        let mut sealed = engine
            .seal_message(b"body", &attachments(), SecurityLevel::SeededStream, None, None)
            .unwrap();
        sealed.attachments[1].envelope.body[20] ^= 1;

        let opened = engine.open_message(&sealed).unwrap();
        assert!(!opened.verified);
        assert!(opened.content.is_none());
    }

    #[test]
    fn failed_attachment_discards_earlier_keys() {
        // Body and first attachment fit, the 300-byte attachment does not.
        let engine = engine_with(KmeConfig {
            max_key_bits: 128 * 8,
            default_key_bytes: 64,
            ..KmeConfig::default()
        });
        let err = engine
            .seal_message(b"body", &attachments(), SecurityLevel::Otp, None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { .. }));

        let entries = engine.key_service().entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.state == KeyState::Destroyed));
    }
}
