//! Runtime configuration for the key service.
//!
//! Every field has a default; `from_env` overrides from `QKME_*` variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `QKME_MAX_KEY_BITS` | `max_key_bits` |
//! | `QKME_DEFAULT_KEY_BYTES` | `default_key_bytes` |
//! | `QKME_KEY_TTL_SECS` | `key_ttl` |
//! | `QKME_POOL_TARGET` | `pool_target` |
//! | `QKME_MAINTENANCE_INTERVAL_SECS` | `maintenance_interval` |
//! | `QKME_MAX_ISSUE_PER_SWEEP` | `max_issue_per_sweep` |
//! | `QKME_TOMBSTONE_RETENTION_SECS` | `tombstone_retention` |
//! | `QKME_DELIVERY_BASE` | `delivery_base` |

use crate::error::KmeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KmeConfig {
    /// Largest key a single request may ask for, in bits.
    pub max_key_bits: usize,
    /// Size of keys issued by pool top-up, in bytes.
    pub default_key_bytes: usize,
    /// Expiry horizon measured from issuance.
    pub key_ttl: Duration,
    /// Active-key count the maintenance sweep keeps the pool at.
    pub pool_target: usize,
    /// How often the background sweep runs.
    pub maintenance_interval: Duration,
    /// Upper bound on keys issued by a single sweep.
    pub max_issue_per_sweep: usize,
    /// How long destroyed tombstones are kept before being purged.
    pub tombstone_retention: Duration,
    /// Prefix of the delivery locator returned to requesters.
    pub delivery_base: String,
}

impl Default for KmeConfig {
    fn default() -> Self {
        Self {
            // 4 MiB: large enough for a one-time pad over a sizeable attachment.
            max_key_bits: 4 * 1024 * 1024 * 8,
            default_key_bytes: 8192,
            key_ttl: Duration::from_secs(24 * 3600),
            pool_target: 10,
            maintenance_interval: Duration::from_secs(5 * 60),
            max_issue_per_sweep: 100,
            tombstone_retention: Duration::from_secs(7 * 86400),
            delivery_base: "/api/v1/keys".into(),
        }
    }
}

impl KmeConfig {
    /// Defaults overridden by any `QKME_*` variable present in the environment.
    pub fn from_env() -> Result<Self, KmeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KmeError> {
        let mut cfg = Self::default();

        if let Some(v) = parse(&lookup, "QKME_MAX_KEY_BITS")? {
            cfg.max_key_bits = v;
        }
        if let Some(v) = parse(&lookup, "QKME_DEFAULT_KEY_BYTES")? {
            cfg.default_key_bytes = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "QKME_KEY_TTL_SECS")? {
            cfg.key_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "QKME_POOL_TARGET")? {
            cfg.pool_target = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "QKME_MAINTENANCE_INTERVAL_SECS")? {
            cfg.maintenance_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "QKME_MAX_ISSUE_PER_SWEEP")? {
            cfg.max_issue_per_sweep = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "QKME_TOMBSTONE_RETENTION_SECS")? {
            cfg.tombstone_retention = Duration::from_secs(v);
        }
        if let Some(v) = lookup("QKME_DELIVERY_BASE") {
            cfg.delivery_base = v.trim_end_matches('/').to_string();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the service cannot honour.
    pub fn validate(&self) -> Result<(), KmeError> {
        if self.max_key_bits == 0 || self.max_key_bits % 8 != 0 {
            return Err(KmeError::ConfigError(format!(
                "max_key_bits must be a positive multiple of 8, got {}",
                self.max_key_bits
            )));
        }
        if self.default_key_bytes == 0 || self.default_key_bytes * 8 > self.max_key_bits {
            return Err(KmeError::ConfigError(format!(
                "default_key_bytes {} outside 1..={}",
                self.default_key_bytes,
                self.max_key_bits / 8
            )));
        }
        if self.key_ttl.is_zero() {
            return Err(KmeError::ConfigError("key_ttl must be non-zero".into()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(KmeError::ConfigError("maintenance_interval must be non-zero".into()));
        }
        Ok(())
    }

    pub fn max_key_bytes(&self) -> usize {
        self.max_key_bits / 8
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, KmeError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| KmeError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
    }
}
