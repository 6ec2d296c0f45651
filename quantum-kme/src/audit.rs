//! Audit logging: every request, acknowledgement and destroy emits a structured event.

use crate::types::{KeyId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditAction {
    KeyRequested { request_id: RequestId, length_bits: usize },
    KeyDelivered { request_id: RequestId, length_bytes: usize },
    RequestRejected { request_id: RequestId, reason: String },
    UsageAcknowledged { consumed_bytes: usize, total_bytes: usize },
    AcknowledgeRejected { consumed_bytes: usize, reason: String },
    KeyExhausted,
    KeyExpired,
    KeyDestroyed,
    TombstonePurged,
    PoolMaintained { expired: usize, purged: usize, issued: usize },
}

impl AuditAction {
    /// Short stable name, as used by `record(action, details)` style sinks.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeyRequested { .. } => "key_requested",
            Self::KeyDelivered { .. } => "key_delivered",
            Self::RequestRejected { .. } => "request_rejected",
            Self::UsageAcknowledged { .. } => "usage_acknowledged",
            Self::AcknowledgeRejected { .. } => "acknowledge_rejected",
            Self::KeyExhausted => "key_exhausted",
            Self::KeyExpired => "key_expired",
            Self::KeyDestroyed => "key_destroyed",
            Self::TombstonePurged => "tombstone_purged",
            Self::PoolMaintained { .. } => "pool_maintained",
        }
    }
}

/// One line of the key lifecycle trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Build time; `KeyService` restamps it from its clock when recording.
    pub timestamp: DateTime<Utc>,
    /// Key the event concerns; `None` for request rejections and sweeps.
    pub key_id: Option<KeyId>,
    pub action: AuditAction,
    /// Who or what triggered this (recipient hint, "maintenance", ...).
    pub actor: String,
    pub success: bool,
    /// Message the consumption was attributed to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Set by [`IntegrityChainSink`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Hex SHA-256 of the preceding chained event; set by [`IntegrityChainSink`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
}

impl AuditEvent {
    pub fn key_event(key_id: &KeyId, action: AuditAction) -> Self {
        Self {
            key_id: Some(key_id.clone()),
            ..Self::system_event(action)
        }
    }

    /// Event not tied to one key, attributed to `"system"` until `with_actor`.
    pub fn system_event(action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            key_id: None,
            action,
            actor: "system".into(),
            success: true,
            message_id: None,
            sequence: None,
            prev_hash: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_message_id(mut self, message_id: Option<&str>) -> Self {
        self.message_id = message_id.map(str::to_string);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Audit sink trait
// ---------------------------------------------------------------------------

/// Where audit events go. Fire-and-forget: sinks never fail the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Emits each event as an `info!` record under the `quantum_kme::audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "quantum_kme::audit",
            timestamp = %event.timestamp,
            key_id = ?event.key_id.as_ref().map(KeyId::as_str),
            action = event.action.name(),
            details = ?event.action,
            actor = %event.actor,
            success = event.success,
            message_id = ?event.message_id,
            "audit"
        );
    }
}

/// Keeps the trail in a `Vec`, queried by tests.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for_key(&self, key_id: &KeyId) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.key_id.as_ref() == Some(key_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Appends one JSON object per line.
pub struct FileAuditSink {
    path: std::path::PathBuf,
    // Serialises appends so concurrent events never interleave within a line.
    write_lock: Mutex<()>,
}

impl FileAuditSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        use std::io::Write;

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "audit serialize failed");
                return;
            }
        };
        let _guard = self.write_lock.lock();
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", json) {
                    tracing::error!(path = %self.path.display(), error = %e, "audit write failed");
                }
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "audit open failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hash-chained trail
// ---------------------------------------------------------------------------

/// Genesis input of the hash chain.
pub const AUDIT_GENESIS: &[u8] = b"quantum-kme-audit-genesis";

/// Numbers events and links each to the digest of the one before it, then
/// forwards to `inner`. A trail read back from disk can be checked with
/// [`verify_chain`].
pub struct IntegrityChainSink {
    inner: Arc<dyn AuditSink>,
    state: Mutex<ChainState>,
}

struct ChainState {
    sequence: u64,
    prev_hash: String,
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

impl IntegrityChainSink {
    pub fn new(inner: Arc<dyn AuditSink>) -> Self {
        Self {
            inner,
            state: Mutex::new(ChainState {
                sequence: 0,
                prev_hash: sha256_hex(AUDIT_GENESIS),
            }),
        }
    }
}

impl AuditSink for IntegrityChainSink {
    fn record(&self, mut event: AuditEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        event.sequence = Some(state.sequence);
        event.prev_hash = Some(state.prev_hash.clone());

        // Hash covers the complete event JSON, sequence and prev_hash included.
        if let Ok(json) = serde_json::to_string(&event) {
            state.prev_hash = sha256_hex(json.as_bytes());
        }
        state.sequence += 1;

        // Forward under the lock so the inner sink sees events in chain order.
        self.inner.record(event);
    }
}

/// Check that `events` form an unbroken chain starting at the genesis hash.
///
/// Returns the sequence number of the first event that breaks the chain.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), u64> {
    let mut expected = sha256_hex(AUDIT_GENESIS);
    for (i, event) in events.iter().enumerate() {
        let seq = i as u64;
        if event.sequence != Some(seq) || event.prev_hash.as_deref() != Some(expected.as_str()) {
            return Err(seq);
        }
        let json = serde_json::to_string(event).map_err(|_| seq)?;
        expected = sha256_hex(json.as_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies_and_detects_edits() {
        let mem = Arc::new(InMemoryAuditSink::new());
        let chain = IntegrityChainSink::new(mem.clone());
        for _ in 0..4 {
            chain.record(AuditEvent::key_event(&KeyId::generate(), AuditAction::KeyDestroyed));
        }

        let mut events = mem.events();
        assert_eq!(events.len(), 4);
        assert_eq!(verify_chain(&events), Ok(()));

        events[2].actor = "mallory".into();
        assert_eq!(verify_chain(&events), Err(3));

        events.remove(1);
        assert_eq!(verify_chain(&events), Err(1));
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = FileAuditSink::new(&path);
        sink.record(AuditEvent::system_event(AuditAction::KeyExpired));
        sink.record(AuditEvent::system_event(AuditAction::TombstonePurged));

        let data = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = data.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.action, AuditAction::TombstonePurged);
    }

    #[test]
    fn action_names_are_snake_case() {
        let a = AuditAction::UsageAcknowledged { consumed_bytes: 1, total_bytes: 2 };
        assert_eq!(a.name(), "usage_acknowledged");
    }
}
