//! Engine error types.

use core::fmt;
use quantum_kme::{KmeError, Unavailable};

/// Every way an encrypt or decrypt can fail.
///
/// A tag mismatch is not an error here: decrypt reports it through
/// [`DecryptOutcome::verified`](crate::DecryptOutcome::verified).
/// [`AuthenticationFailed`](EngineError::AuthenticationFailed) only appears when
/// a caller asks for the verified plaintext of an unverified outcome.
#[derive(Debug)]
pub enum EngineError {
    /// Key service refused the requested length.
    CapacityExceeded { requested_bits: usize, max_bits: usize },
    /// Referenced key is unknown, expired or exhausted.
    KeyUnavailable { reason: Unavailable },
    /// Key was destroyed after a view-once read.
    KeyDestroyed,
    /// Acknowledging the consumption would exceed the key's cap. The envelope
    /// must not be persisted.
    ConsumptionOverrun,
    AuthenticationFailed,
    UnsupportedLevel(u8),
    MalformedEnvelope(&'static str),
    /// Any other key service failure (storage, configuration).
    KeyService(KmeError),
}

impl EngineError {
    /// Whether the key behind an envelope can no longer be obtained.
    pub fn is_key_gone(&self) -> bool {
        matches!(self, Self::KeyUnavailable { .. } | Self::KeyDestroyed)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { requested_bits, max_bits } => {
                write!(f, "capacity exceeded: {} bits requested, max {}", requested_bits, max_bits)
            }
            Self::KeyUnavailable { reason } => write!(f, "key unavailable: {}", reason),
            Self::KeyDestroyed => write!(f, "key destroyed: message was already read"),
            Self::ConsumptionOverrun => write!(f, "key consumption overrun"),
            Self::AuthenticationFailed => write!(f, "authentication failed"),
            Self::UnsupportedLevel(tag) => write!(f, "unsupported security level: {}", tag),
            Self::MalformedEnvelope(what) => write!(f, "malformed envelope: {}", what),
            Self::KeyService(e) => write!(f, "key service: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::KeyService(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KmeError> for EngineError {
    fn from(e: KmeError) -> Self {
        match e {
            KmeError::CapacityExceeded { requested_bits, max_bits } => {
                Self::CapacityExceeded { requested_bits, max_bits }
            }
            KmeError::KeyUnavailable { reason: Unavailable::Destroyed, .. } => Self::KeyDestroyed,
            KmeError::KeyUnavailable { reason, .. } => Self::KeyUnavailable { reason },
            KmeError::ConsumptionOverrun { .. } => Self::ConsumptionOverrun,
            other => Self::KeyService(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantum_kme::KeyId;

    #[test]
    fn destroyed_keys_map_to_view_once_error() {
        let e = KmeError::KeyUnavailable { id: KeyId::new("k"), reason: Unavailable::Destroyed };
        assert!(matches!(EngineError::from(e), EngineError::KeyDestroyed));

        let e = KmeError::KeyUnavailable { id: KeyId::new("k"), reason: Unavailable::Expired };
        assert!(matches!(
            EngineError::from(e),
            EngineError::KeyUnavailable { reason: Unavailable::Expired }
        ));
    }

    #[test]
    fn storage_errors_pass_through() {
        let e = EngineError::from(KmeError::StorageError("disk".into()));
        assert!(matches!(e, EngineError::KeyService(_)));
        assert!(std::error::Error::source(&e).is_some());
    }
}
