//! Security levels.
//!
//! Four independent strategies, not a ranking. The wire tag is stable.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SecurityLevel {
    /// One-time pad: XOR with pad material the length of the payload.
    Otp,
    /// Stream cipher keyed from a short quantum seed.
    SeededStream,
    /// Stream cipher keyed through a simulated hybrid KEM.
    HybridSimulated,
    /// No encryption.
    Plain,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Otp,
        SecurityLevel::SeededStream,
        SecurityLevel::HybridSimulated,
        SecurityLevel::Plain,
    ];

    pub fn tag(self) -> u8 {
        match self {
            Self::Otp => 1,
            Self::SeededStream => 2,
            Self::HybridSimulated => 3,
            Self::Plain => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Otp => "otp",
            Self::SeededStream => "seeded-stream",
            Self::HybridSimulated => "hybrid",
            Self::Plain => "plain",
        }
    }

    /// Whether envelopes at this level carry an authentication tag.
    pub fn is_authenticated(self) -> bool {
        !matches!(self, Self::Plain)
    }

    /// View-once levels require destroying the key after a verified read.
    pub fn is_view_once(self) -> bool {
        matches!(self, Self::Otp)
    }
}

impl TryFrom<u8> for SecurityLevel {
    type Error = EngineError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Otp),
            2 => Ok(Self::SeededStream),
            3 => Ok(Self::HybridSimulated),
            4 => Ok(Self::Plain),
            other => Err(EngineError::UnsupportedLevel(other)),
        }
    }
}

impl From<SecurityLevel> for u8 {
    fn from(level: SecurityLevel) -> u8 {
        level.tag()
    }
}

impl FromStr for SecurityLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otp" | "1" => Ok(Self::Otp),
            "seeded-stream" | "stream" | "2" => Ok(Self::SeededStream),
            "hybrid" | "3" => Ok(Self::HybridSimulated),
            "plain" | "4" => Ok(Self::Plain),
            _ => Err(EngineError::UnsupportedLevel(0)),
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for level in SecurityLevel::ALL {
            assert_eq!(SecurityLevel::try_from(level.tag()).unwrap(), level);
            assert_eq!(level.name().parse::<SecurityLevel>().unwrap(), level);
        }
    }

    #[test]
    fn unknown_tags_rejected() {
        for tag in [0u8, 5, 0xff] {
            assert!(matches!(
                SecurityLevel::try_from(tag),
                Err(EngineError::UnsupportedLevel(t)) if t == tag
            ));
        }
        assert!("kyber".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn serde_uses_numeric_tag() {
        assert_eq!(serde_json::to_string(&SecurityLevel::HybridSimulated).unwrap(), "3");
        let level: SecurityLevel = serde_json::from_str("1").unwrap();
        assert_eq!(level, SecurityLevel::Otp);
        assert!(serde_json::from_str::<SecurityLevel>("9").is_err());
    }
}
