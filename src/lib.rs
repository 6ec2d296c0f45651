//! # Quantum Envelope
//!
//! Tiered encryption over key material issued by a quantum key management
//! entity ([`quantum_kme`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use quantum_envelope::{CryptoEngine, SecurityLevel};
//! use quantum_kme::{InMemoryAuditSink, InMemoryBackend, KeyService};
//! use std::sync::Arc;
//!
//! let kme = Arc::new(KeyService::new(
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(InMemoryAuditSink::new()),
//! ));
//! let engine = CryptoEngine::new(kme);
//!
//! let envelope = engine.encrypt(b"secret", SecurityLevel::SeededStream, Some("bob")).unwrap();
//! let plaintext = engine.decrypt(&envelope).unwrap().into_verified().unwrap();
//!
//! assert_eq!(plaintext, b"secret");
//! ```
//!
//! ## Levels
//!
//! - **One-time pad**: XOR with a pad as long as the payload, HMAC tag keyed
//!   from the 32 pad bytes after the data region. View-once.
//! - **Seeded stream**: 32-byte seed, HKDF-derived keys, SHA-256 hash-chain
//!   keystream, HMAC tag over nonce and ciphertext.
//! - **Hybrid (simulated)**: 96-byte seed fed to a [`KemProvider`]; the shared
//!   secret keys the same stream construction.
//! - **Plain**: passthrough, no key.
//!
//! ## What's NOT Provided
//!
//! - A real lattice KEM or a standard AEAD (the hybrid level is simulated)
//! - Envelope storage (callers purge view-once envelopes themselves)
//! - Silent level downgrade on key shortage

#![deny(unsafe_code)]

pub mod engine;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod kem;
pub mod level;
pub mod message;
pub mod stream;

// Wire module is public for the fuzz target and tooling
// but should not be considered stable API
#[doc(hidden)]
pub mod wire;

pub use engine::{CryptoEngine, DecryptOutcome};
pub use envelope::{EncryptionEnvelope, LevelParams};
pub use error::EngineError;
pub use kem::{Encapsulation, KemProvider, SimulatedKem};
pub use level::SecurityLevel;
pub use message::{Attachment, MessageContent, OpenedMessage, SealedAttachment, SealedMessage};
