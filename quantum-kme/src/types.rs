//! Core types: KeyId, RequestId, KeyState, KeyEntry, KeyRequest, SecretBytes.

use chrono::{DateTime, Utc};
use rand_core::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Key identifier: 32 lowercase hex characters when generated by the service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap an identifier received over the protocol surface.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a key request as supplied by the requesting SAE.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(format!("req_{}", hex::encode(bytes)))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Secret bytes
// ---------------------------------------------------------------------------

/// Raw key material. Zeroized on drop, redacted in `Debug`, hex on disk.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Fill a fresh buffer of `len` bytes from the OS CSPRNG.
    pub fn random(len: usize) -> Self {
        let mut buf = vec![0u8; len];
        rand_core::OsRng.fill_bytes(&mut buf);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite the material with zeros and release it.
    pub fn erase(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

impl Serialize for SecretBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map(Self).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Key lifecycle state machine
// ---------------------------------------------------------------------------

/// Key lifecycle state.
///
/// ```text
/// ACTIVE ──→ EXHAUSTED ──→ EXPIRED ──→ DESTROYED
///   │            │                        ↑
///   ├──→ EXPIRED └────────────────────────┤
///   └─────────────────────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    /// Issued, unexpired, with remaining capacity.
    Active,
    /// Consumption cap reached. Still readable for decryption until expiry.
    Exhausted,
    /// Past its expiry horizon. Never returned again.
    Expired,
    /// Material erased; the entry survives as a tombstone.
    Destroyed,
}

impl KeyState {
    /// Whether this state accepts further consumption.
    pub fn can_consume(&self) -> bool {
        matches!(self, KeyState::Active)
    }

    /// Whether material may be handed out for decrypting existing ciphertext.
    pub fn can_decrypt(&self) -> bool {
        matches!(self, KeyState::Active | KeyState::Exhausted)
    }

    /// States reachable in one step.
    pub fn valid_transitions(&self) -> &[KeyState] {
        match self {
            KeyState::Active => &[KeyState::Exhausted, KeyState::Expired, KeyState::Destroyed],
            KeyState::Exhausted => &[KeyState::Expired, KeyState::Destroyed],
            KeyState::Expired => &[KeyState::Destroyed],
            KeyState::Destroyed => &[],
        }
    }

    pub fn can_transition_to(&self, target: KeyState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyState::Active => write!(f, "ACTIVE"),
            KeyState::Exhausted => write!(f, "EXHAUSTED"),
            KeyState::Expired => write!(f, "EXPIRED"),
            KeyState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Key entry
// ---------------------------------------------------------------------------

/// A unit of issued key material and its consumption bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Unique identifier.
    pub id: KeyId,
    /// Raw key material (empty once destroyed).
    pub material: SecretBytes,
    /// Declared length in bytes.
    pub length_bytes: usize,
    /// Bytes consumed so far.
    pub consumed_bytes: usize,
    /// Upper bound on `consumed_bytes`.
    pub max_consumption_bytes: usize,
    /// Recipient hint supplied at request time.
    pub recipient: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: KeyState,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl KeyEntry {
    /// Whether the entry is active at `now` (state and expiry both checked).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == KeyState::Active && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn remaining_bytes(&self) -> usize {
        self.max_consumption_bytes.saturating_sub(self.consumed_bytes)
    }

    /// Metadata copy with the material stripped.
    pub fn redacted(&self) -> KeyEntry {
        KeyEntry {
            material: SecretBytes::default(),
            ..self.clone()
        }
    }
}

/// Key material handed out by a fetch.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub key_id: KeyId,
    pub bytes: SecretBytes,
}

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Key requests (audit record, independent of the entry lifecycle)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Delivered,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    pub request_id: RequestId,
    pub length_bits: usize,
    pub recipient: Option<String>,
    pub status: RequestStatus,
    pub key_id: Option<KeyId>,
    pub delivery_locator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Result of a successful key request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDelivery {
    pub key_id: KeyId,
    pub delivery_locator: String,
}

// ---------------------------------------------------------------------------
// Pool reporting
// ---------------------------------------------------------------------------

/// Snapshot of the active part of the pool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub key_count: usize,
    pub total_capacity_bytes: usize,
    pub consumed_bytes: usize,
    pub remaining_bytes: usize,
    pub utilization_percent: f64,
}

/// Outcome of one maintenance sweep.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Entries removed because they expired.
    pub expired: Vec<KeyId>,
    /// Destroyed tombstones purged after the retention window.
    pub purged: Vec<KeyId>,
    /// Newly issued keys.
    pub issued: Vec<KeyId>,
    /// Active keys counted before top-up.
    pub active_before: usize,
    /// Issuance failures this sweep (corrected on the next one).
    pub failed: Vec<String>,
    /// Request records dropped from the request log.
    #[serde(default)]
    pub pruned_requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bytes_debug_is_redacted() {
        let s = SecretBytes::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", s), "SecretBytes([REDACTED; 3])");
    }

    #[test]
    fn secret_bytes_hex_serde() {
        let s = SecretBytes::new(vec![0xde, 0xad]);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"dead\"");
        let back: SecretBytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_bytes(), &[0xde, 0xad]);
    }

    #[test]
    fn state_machine_transitions() {
        assert!(KeyState::Active.can_transition_to(KeyState::Exhausted));
        assert!(KeyState::Exhausted.can_transition_to(KeyState::Destroyed));
        assert!(!KeyState::Exhausted.can_transition_to(KeyState::Active));
        assert!(!KeyState::Destroyed.can_transition_to(KeyState::Active));
        assert!(KeyState::Exhausted.can_decrypt());
        assert!(!KeyState::Exhausted.can_consume());
    }
}
