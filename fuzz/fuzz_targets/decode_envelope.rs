#![no_main]

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;
use quantum_envelope::{CryptoEngine, EncryptionEnvelope};
use quantum_kme::{InMemoryAuditSink, InMemoryBackend, KeyService};
use std::sync::Arc;

static ENGINE: Lazy<CryptoEngine> = Lazy::new(|| {
    let kme = KeyService::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(InMemoryAuditSink::new()),
    );
    CryptoEngine::new(Arc::new(kme))
});

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = EncryptionEnvelope::from_bytes(data) else {
        return;
    };

    // Anything that decodes must re-encode to the same bytes.
    assert_eq!(envelope.to_bytes(), data);

    // Keys are never issued here, so decrypt must fail cleanly or pass plain bodies through.
    let _ = ENGINE.decrypt(&envelope);
});
