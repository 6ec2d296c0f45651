//! Key service: issues key material, enforces consumption limits, expires
//! stale entries and keeps the pool topped up.

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::KmeConfig;
use crate::error::{KmeError, Unavailable};
use crate::storage::StorageBackend;
use crate::types::*;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Receipt for an accepted acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckReceipt {
    pub key_id: KeyId,
    /// Running total after this acknowledgement.
    pub consumed_bytes: usize,
    pub remaining_bytes: usize,
    /// This acknowledgement reached the cap.
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// Key service
// ---------------------------------------------------------------------------

pub struct KeyService {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: KmeConfig,
    requests: RwLock<HashMap<String, KeyRequest>>,
    // Serialises sweeps against each other only; request/ack/destroy never take it.
    maintenance: Mutex<()>,
}

impl KeyService {
    /// Create a key service with default configuration and the system clock.
    pub fn new(storage: Arc<dyn StorageBackend>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_config(storage, audit, KmeConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn StorageBackend>,
        audit: Arc<dyn AuditSink>,
        config: KmeConfig,
    ) -> Self {
        Self {
            storage,
            audit,
            clock: Arc::new(SystemClock),
            config,
            requests: RwLock::new(HashMap::new()),
            maintenance: Mutex::new(()),
        }
    }

    /// Replace the time source (tests use `ManualClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &KmeConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stamp `event` with the service clock and hand it to the sink.
    fn record(&self, mut event: AuditEvent) {
        event.timestamp = self.clock.now();
        self.audit.record(event);
    }

    // -----------------------------------------------------------------------
    // Request
    // -----------------------------------------------------------------------

    /// Issue `requested_bits` of fresh key material under a generated request id.
    pub fn request_key(
        &self,
        requested_bits: usize,
        recipient: Option<&str>,
    ) -> Result<KeyDelivery, KmeError> {
        self.request_key_with_id(RequestId::generate(), requested_bits, recipient)
    }

    /// Issue key material for a caller-supplied request id.
    ///
    /// Replaying a request id that was already delivered, with the same length,
    /// returns the original delivery without issuing new material. A replay with
    /// a different length, or one arriving while the first is still pending, is
    /// `DuplicateRequest`. Request records are dropped by the maintenance sweep
    /// once their key is purged or `tombstone_retention` has passed since
    /// delivery; after that the id is accepted as new.
    pub fn request_key_with_id(
        &self,
        request_id: RequestId,
        requested_bits: usize,
        recipient: Option<&str>,
    ) -> Result<KeyDelivery, KmeError> {
        if let Err(e) = self.check_length(requested_bits) {
            self.record(
                AuditEvent::system_event(AuditAction::RequestRejected {
                    request_id: request_id.clone(),
                    reason: e.to_string(),
                })
                .with_actor(recipient.unwrap_or("anonymous"))
                .with_failure(),
            );
            tracing::warn!(request_id = %request_id, requested_bits, error = %e, "key request rejected");
            return Err(e);
        }

        {
            let mut requests = self.requests.write().map_err(poisoned)?;
            if let Some(existing) = requests.get(request_id.as_str()) {
                return match (&existing.key_id, &existing.delivery_locator) {
                    (Some(key_id), Some(locator)) if existing.length_bits == requested_bits => {
                        tracing::debug!(request_id = %request_id, "replayed key request");
                        Ok(KeyDelivery {
                            key_id: key_id.clone(),
                            delivery_locator: locator.clone(),
                        })
                    }
                    _ => Err(KmeError::DuplicateRequest(request_id)),
                };
            }
            requests.insert(
                request_id.as_str().to_string(),
                KeyRequest {
                    request_id: request_id.clone(),
                    length_bits: requested_bits,
                    recipient: recipient.map(str::to_string),
                    status: RequestStatus::Pending,
                    key_id: None,
                    delivery_locator: None,
                    created_at: self.clock.now(),
                    delivered_at: None,
                },
            );
        }
        self.record(
            AuditEvent::system_event(AuditAction::KeyRequested {
                request_id: request_id.clone(),
                length_bits: requested_bits,
            })
            .with_actor(recipient.unwrap_or("anonymous")),
        );

        let entry = match self.issue_entry(requested_bits / 8, recipient) {
            Ok(entry) => entry,
            Err(e) => {
                // Leave nothing behind for a failed request.
                if let Ok(mut requests) = self.requests.write() {
                    requests.remove(request_id.as_str());
                }
                self.record(
                    AuditEvent::system_event(AuditAction::RequestRejected {
                        request_id,
                        reason: e.to_string(),
                    })
                    .with_failure(),
                );
                return Err(e);
            }
        };

        let delivery = KeyDelivery {
            key_id: entry.id.clone(),
            delivery_locator: format!("{}/{}", self.config.delivery_base, entry.id),
        };
        {
            let mut requests = self.requests.write().map_err(poisoned)?;
            if let Some(req) = requests.get_mut(request_id.as_str()) {
                req.status = RequestStatus::Delivered;
                req.key_id = Some(delivery.key_id.clone());
                req.delivery_locator = Some(delivery.delivery_locator.clone());
                req.delivered_at = Some(self.clock.now());
            }
        }
        self.record(
            AuditEvent::key_event(
                &entry.id,
                AuditAction::KeyDelivered {
                    request_id: request_id.clone(),
                    length_bytes: entry.length_bytes,
                },
            )
            .with_actor(recipient.unwrap_or("anonymous")),
        );
        tracing::info!(
            request_id = %request_id,
            key_id = %entry.id,
            length_bytes = entry.length_bytes,
            "key delivered"
        );

        Ok(delivery)
    }

    /// The audit record for a request, if one exists.
    pub fn key_request(&self, request_id: &RequestId) -> Option<KeyRequest> {
        self.requests.read().ok()?.get(request_id.as_str()).cloned()
    }

    fn check_length(&self, requested_bits: usize) -> Result<(), KmeError> {
        if requested_bits == 0 || requested_bits % 8 != 0 {
            return Err(KmeError::InvalidLength { requested_bits });
        }
        if requested_bits > self.config.max_key_bits {
            return Err(KmeError::CapacityExceeded {
                requested_bits,
                max_bits: self.config.max_key_bits,
            });
        }
        Ok(())
    }

    /// Generate and store a fresh entry. The cap equals the length: callers that
    /// need authentication overhead request it as extra length.
    fn issue_entry(&self, length_bytes: usize, recipient: Option<&str>) -> Result<KeyEntry, KmeError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.key_ttl)
            .map_err(|e| KmeError::ConfigError(format!("key_ttl: {}", e)))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| KmeError::ConfigError("key_ttl overflows the calendar".into()))?;

        let entry = KeyEntry {
            id: KeyId::generate(),
            material: SecretBytes::random(length_bytes),
            length_bytes,
            consumed_bytes: 0,
            max_consumption_bytes: length_bytes,
            recipient: recipient.map(str::to_string),
            created_at: now,
            expires_at,
            state: KeyState::Active,
            destroyed_at: None,
        };
        self.storage.insert(entry.clone())?;
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Material of an active, unexpired key.
    pub fn fetch_key(&self, id: &KeyId) -> Result<KeyMaterial, KmeError> {
        self.lookup(id, KeyState::can_consume)
    }

    /// Material for decrypting ciphertext already produced under `id`.
    ///
    /// Unlike [`fetch_key`](Self::fetch_key), a fully consumed key is still
    /// returned until it expires or is destroyed.
    pub fn retrieve_for_decrypt(&self, id: &KeyId) -> Result<KeyMaterial, KmeError> {
        self.lookup(id, KeyState::can_decrypt)
    }

    fn lookup(&self, id: &KeyId, allowed: fn(&KeyState) -> bool) -> Result<KeyMaterial, KmeError> {
        let now = self.clock.now();
        let entry = self
            .storage
            .get(id)?
            .ok_or_else(|| KmeError::unavailable(id, Unavailable::Unknown))?;

        if !allowed(&entry.state) {
            return Err(KmeError::unavailable(id, Unavailable::from_state(entry.state)));
        }
        if entry.is_expired(now) {
            return Err(KmeError::unavailable(id, Unavailable::Expired));
        }
        tracing::debug!(key_id = %id, state = %entry.state, "key material handed out");
        Ok(KeyMaterial {
            key_id: id.clone(),
            bytes: entry.material.clone(),
        })
    }

    /// Entry metadata with the material stripped.
    pub fn entry(&self, id: &KeyId) -> Result<Option<KeyEntry>, KmeError> {
        Ok(self.storage.get(id)?.map(|e| e.redacted()))
    }

    /// All entries, material stripped.
    pub fn entries(&self) -> Result<Vec<KeyEntry>, KmeError> {
        Ok(self.storage.list()?.iter().map(KeyEntry::redacted).collect())
    }

    // -----------------------------------------------------------------------
    // Acknowledge
    // -----------------------------------------------------------------------

    /// Record `consumed_bytes` of usage against `id`.
    ///
    /// The new total is computed and committed under the entry lock. A total
    /// above the cap is rejected and leaves the entry untouched.
    pub fn acknowledge_usage(
        &self,
        id: &KeyId,
        consumed_bytes: usize,
        message_id: Option<&str>,
    ) -> Result<AckReceipt, KmeError> {
        let now = self.clock.now();
        let result = self.storage.update(id, &mut |entry| {
            if entry.state != KeyState::Active {
                return Err(KmeError::unavailable(id, Unavailable::from_state(entry.state)));
            }
            if entry.is_expired(now) {
                return Err(KmeError::unavailable(id, Unavailable::Expired));
            }
            let total = entry
                .consumed_bytes
                .checked_add(consumed_bytes)
                .filter(|t| *t <= entry.max_consumption_bytes)
                .ok_or_else(|| KmeError::ConsumptionOverrun {
                    id: id.clone(),
                    consumed: entry.consumed_bytes,
                    requested: consumed_bytes,
                    max: entry.max_consumption_bytes,
                })?;
            entry.consumed_bytes = total;
            if total == entry.max_consumption_bytes {
                entry.state = KeyState::Exhausted;
            }
            Ok(())
        });

        let entry = match result {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                let e = KmeError::unavailable(id, Unavailable::Unknown);
                self.reject_ack(id, consumed_bytes, message_id, &e);
                return Err(e);
            }
            Err(e) => {
                self.reject_ack(id, consumed_bytes, message_id, &e);
                return Err(e);
            }
        };

        let exhausted = entry.state == KeyState::Exhausted;
        self.record(
            AuditEvent::key_event(
                id,
                AuditAction::UsageAcknowledged {
                    consumed_bytes,
                    total_bytes: entry.consumed_bytes,
                },
            )
            .with_message_id(message_id),
        );
        if exhausted {
            self.record(AuditEvent::key_event(id, AuditAction::KeyExhausted));
        }
        tracing::debug!(
            key_id = %id,
            consumed_bytes,
            total = entry.consumed_bytes,
            max = entry.max_consumption_bytes,
            exhausted,
            "usage acknowledged"
        );

        Ok(AckReceipt {
            key_id: id.clone(),
            consumed_bytes: entry.consumed_bytes,
            remaining_bytes: entry.remaining_bytes(),
            exhausted,
        })
    }

    fn reject_ack(&self, id: &KeyId, consumed_bytes: usize, message_id: Option<&str>, e: &KmeError) {
        self.record(
            AuditEvent::key_event(
                id,
                AuditAction::AcknowledgeRejected {
                    consumed_bytes,
                    reason: e.to_string(),
                },
            )
            .with_message_id(message_id)
            .with_failure(),
        );
        tracing::warn!(key_id = %id, consumed_bytes, error = %e, "acknowledgement rejected");
    }

    // -----------------------------------------------------------------------
    // Destroy
    // -----------------------------------------------------------------------

    /// Irrecoverably erase the material of `id`, keeping a tombstone.
    ///
    /// Destroying an unknown or already destroyed key is a no-op.
    pub fn destroy_key(&self, id: &KeyId) -> Result<(), KmeError> {
        let now = self.clock.now();
        let mut destroyed = false;
        self.storage.update(id, &mut |entry| {
            if entry.state == KeyState::Destroyed {
                return Ok(());
            }
            transition(entry, KeyState::Destroyed)?;
            entry.material.erase();
            entry.destroyed_at = Some(now);
            destroyed = true;
            Ok(())
        })?;

        if destroyed {
            self.record(AuditEvent::key_event(id, AuditAction::KeyDestroyed));
            tracing::info!(key_id = %id, "key destroyed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pool
    // -----------------------------------------------------------------------

    /// Capacity and consumption over the active entries.
    pub fn pool_stats(&self) -> Result<PoolStats, KmeError> {
        let now = self.clock.now();
        let mut stats = PoolStats::default();
        for entry in self.storage.list()?.iter().filter(|e| e.is_active(now)) {
            stats.key_count += 1;
            stats.total_capacity_bytes += entry.max_consumption_bytes;
            stats.consumed_bytes += entry.consumed_bytes;
        }
        stats.remaining_bytes = stats.total_capacity_bytes - stats.consumed_bytes;
        if stats.total_capacity_bytes > 0 {
            stats.utilization_percent =
                stats.consumed_bytes as f64 * 100.0 / stats.total_capacity_bytes as f64;
        }
        Ok(stats)
    }

    /// `maintain_pool` with the configured target and key size.
    pub fn maintain(&self) -> Result<MaintenanceReport, KmeError> {
        self.maintain_pool(self.config.pool_target, self.config.default_key_bytes)
    }

    /// Expire stale entries, purge old tombstones, and issue new keys of
    /// `key_size_bytes` until `target_active` active keys exist.
    ///
    /// Idempotent: a second call with the same target issues nothing.
    /// At most `max_issue_per_sweep` keys are issued per call.
    pub fn maintain_pool(
        &self,
        target_active: usize,
        key_size_bytes: usize,
    ) -> Result<MaintenanceReport, KmeError> {
        let _sweep = self.maintenance.lock().map_err(poisoned)?;
        let now = self.clock.now();
        let retention = chrono::Duration::from_std(self.config.tombstone_retention)
            .unwrap_or(chrono::Duration::MAX);
        let mut report = MaintenanceReport::default();

        for entry in self.storage.list()? {
            match entry.state {
                KeyState::Destroyed | KeyState::Expired => {
                    let since = entry.destroyed_at.unwrap_or(entry.expires_at);
                    if elapsed_past(since, retention, now) {
                        self.storage.remove(&entry.id)?;
                        self.record(AuditEvent::key_event(&entry.id, AuditAction::TombstonePurged));
                        report.purged.push(entry.id);
                    }
                }
                KeyState::Active | KeyState::Exhausted if entry.is_expired(now) => {
                    let mut expired = false;
                    self.storage.update(&entry.id, &mut |e| {
                        // Re-check under the entry lock; a destroy may have won.
                        if e.is_expired(now) && e.state.can_transition_to(KeyState::Expired) {
                            transition(e, KeyState::Expired)?;
                            e.material.erase();
                            expired = true;
                        }
                        Ok(())
                    })?;
                    if expired {
                        self.record(
                            AuditEvent::key_event(&entry.id, AuditAction::KeyExpired).with_actor("maintenance"),
                        );
                        report.expired.push(entry.id);
                    }
                }
                KeyState::Active => report.active_before += 1,
                KeyState::Exhausted => {}
            }
        }

        report.pruned_requests = self.prune_requests(&report.purged, retention, now)?;

        let deficit = target_active.saturating_sub(report.active_before);
        let to_issue = deficit.min(self.config.max_issue_per_sweep);
        if to_issue < deficit {
            tracing::warn!(
                deficit,
                cap = self.config.max_issue_per_sweep,
                "pool deficit above per-sweep cap; remainder deferred"
            );
        }

        if to_issue > 0 {
            if let Err(e) = self.check_length(key_size_bytes.saturating_mul(8)) {
                tracing::warn!(key_size_bytes, error = %e, "pool top-up skipped");
                report.failed.push(e.to_string());
            } else {
                for _ in 0..to_issue {
                    match self.issue_entry(key_size_bytes, None) {
                        Ok(entry) => report.issued.push(entry.id),
                        Err(e) => {
                            tracing::warn!(error = %e, "pool top-up issuance failed");
                            report.failed.push(e.to_string());
                        }
                    }
                }
            }
        }

        self.record(
            AuditEvent::system_event(AuditAction::PoolMaintained {
                expired: report.expired.len(),
                purged: report.purged.len(),
                issued: report.issued.len(),
            })
            .with_actor("maintenance"),
        );
        tracing::info!(
            active_before = report.active_before,
            expired = report.expired.len(),
            purged = report.purged.len(),
            pruned_requests = report.pruned_requests,
            issued = report.issued.len(),
            failed = report.failed.len(),
            "pool maintained"
        );

        Ok(report)
    }

    /// Drop delivered request records whose key was purged, or that were
    /// delivered longer than `retention` ago. Pending records are kept.
    fn prune_requests(
        &self,
        purged: &[KeyId],
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, KmeError> {
        let purged: HashSet<&KeyId> = purged.iter().collect();
        let mut requests = self.requests.write().map_err(poisoned)?;
        let before = requests.len();
        requests.retain(|_, req| {
            let key_gone = req.key_id.as_ref().is_some_and(|id| purged.contains(id));
            let stale = req.delivered_at.is_some_and(|at| elapsed_past(at, retention, now));
            !(key_gone || stale)
        });
        Ok(before - requests.len())
    }

    /// How often the background sweep should run.
    pub fn maintenance_interval(&self) -> Duration {
        self.config.maintenance_interval
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transition(entry: &mut KeyEntry, target: KeyState) -> Result<(), KmeError> {
    if !entry.state.can_transition_to(target) {
        return Err(KmeError::InvalidTransition {
            id: entry.id.clone(),
            from: entry.state,
            to: target,
        });
    }
    entry.state = target;
    Ok(())
}

fn elapsed_past(since: DateTime<Utc>, window: chrono::Duration, now: DateTime<Utc>) -> bool {
    since.checked_add_signed(window).is_some_and(|deadline| deadline <= now)
}

fn poisoned<T>(_: T) -> KmeError {
    KmeError::StorageError("lock poisoned".into())
}
