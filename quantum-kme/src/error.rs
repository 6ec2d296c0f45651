//! Error types for the key management entity.

use crate::types::{KeyId, KeyState, RequestId};
use std::fmt;

// ---------------------------------------------------------------------------
// Why a key could not be handed out
// ---------------------------------------------------------------------------

/// Reason a key lookup failed. The protocol surface collapses every reason to
/// "not found"; in-process callers keep the distinction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unavailable {
    /// No entry with that id was ever issued (or it has been swept).
    Unknown,
    /// The entry is past its expiry horizon.
    Expired,
    /// The consumption cap has been reached.
    Exhausted,
    /// Material was erased by an explicit destroy.
    Destroyed,
}

impl Unavailable {
    pub(crate) fn from_state(state: KeyState) -> Self {
        match state {
            KeyState::Active => Unavailable::Unknown,
            KeyState::Exhausted => Unavailable::Exhausted,
            KeyState::Expired => Unavailable::Expired,
            KeyState::Destroyed => Unavailable::Destroyed,
        }
    }
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Expired => write!(f, "expired"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum KmeError {
    /// Requested length above the configured maximum.
    CapacityExceeded { requested_bits: usize, max_bits: usize },
    /// Requested length is zero or not a whole number of bytes.
    InvalidLength { requested_bits: usize },
    /// Key cannot be handed out or consumed.
    KeyUnavailable { id: KeyId, reason: Unavailable },
    /// Acknowledgement would push consumption past the cap.
    ConsumptionOverrun {
        id: KeyId,
        consumed: usize,
        requested: usize,
        max: usize,
    },
    /// Request id is still pending, or was delivered for a different length.
    DuplicateRequest(RequestId),
    InvalidTransition { id: KeyId, from: KeyState, to: KeyState },
    StorageError(String),
    ConfigError(String),
}

impl KmeError {
    pub(crate) fn unavailable(id: &KeyId, reason: Unavailable) -> Self {
        Self::KeyUnavailable { id: id.clone(), reason }
    }

    /// Whether the protocol surface should answer 404 for this error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyUnavailable { .. })
    }
}

impl fmt::Display for KmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { requested_bits, max_bits } => {
                write!(f, "capacity exceeded: requested {} bits, max {}", requested_bits, max_bits)
            }
            Self::InvalidLength { requested_bits } => {
                write!(f, "invalid key length: {} bits (must be a positive multiple of 8)", requested_bits)
            }
            Self::KeyUnavailable { id, reason } => write!(f, "key unavailable ({}): {}", reason, id),
            Self::ConsumptionOverrun { id, consumed, requested, max } => write!(
                f,
                "consumption overrun for {}: {} consumed + {} requested > {} max",
                id, consumed, requested, max
            ),
            Self::DuplicateRequest(id) => write!(f, "request id already in use: {}", id),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {}: {} → {}", id, from, to)
            }
            Self::StorageError(msg) => write!(f, "storage error: {}", msg),
            Self::ConfigError(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for KmeError {}

impl From<serde_json::Error> for KmeError {
    fn from(e: serde_json::Error) -> Self {
        Self::StorageError(format!("serde: {}", e))
    }
}
