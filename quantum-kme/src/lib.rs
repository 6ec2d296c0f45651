//! # Quantum KME
//!
//! Key management entity for quantum-distributed key material.
//!
//! Issues keys on request, tracks how many bytes of each key have been
//! consumed, expires keys past their horizon, destroys material on demand,
//! and keeps a pool of ready keys topped up. Every mutation is audited.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quantum_kme::*;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(InMemoryBackend::new());
//! let audit = Arc::new(InMemoryAuditSink::new());
//! let kme = KeyService::new(storage, audit);
//!
//! let delivery = kme.request_key(256, Some("bob")).unwrap();
//! let key = kme.fetch_key(&delivery.key_id).unwrap();
//! assert_eq!(key.len(), 32);
//!
//! kme.acknowledge_usage(&delivery.key_id, 32, None).unwrap();
//! kme.destroy_key(&delivery.key_id).unwrap();
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod service;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use audit::{
    verify_chain, AuditAction, AuditEvent, AuditSink, FileAuditSink, InMemoryAuditSink,
    IntegrityChainSink, TracingAuditSink,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KmeConfig;
pub use error::{KmeError, Unavailable};
pub use maintenance::spawn_maintenance;
pub use service::{AckReceipt, KeyService};
pub use storage::{EntryUpdate, FileBackend, InMemoryBackend, StorageBackend};
pub use types::{
    KeyDelivery, KeyEntry, KeyId, KeyMaterial, KeyRequest, KeyState, MaintenanceReport,
    PoolStats, RequestId, RequestStatus, SecretBytes,
};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
