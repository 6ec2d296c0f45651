#![no_main]

use libfuzzer_sys::fuzz_target;
use quantum_envelope::EncryptionEnvelope;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(envelope) = EncryptionEnvelope::from_json(s) {
        assert!(envelope.validate().is_ok());
        let again = EncryptionEnvelope::from_bytes(&envelope.to_bytes());
        assert_eq!(again.ok(), Some(envelope));
    }
});
