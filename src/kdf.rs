//! Key derivation
//!
//! info = PROTOCOL_ID || context || label
//! key  = HKDF-SHA256(ikm, salt=None, info=info, len=32)

use hkdf::Hkdf;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::PROTOCOL_ID;

/// Context strings, one per derivation purpose.
pub const CTX_SEEDED_STREAM: &[u8] = b"|seeded-stream|";
pub const CTX_KEM_PRIVATE: &[u8] = b"|kem-private|";
pub const CTX_KEM_PUBLIC: &[u8] = b"|kem-public|";
pub const CTX_KEM_SHARED: &[u8] = b"|kem-shared|";
pub const CTX_HYBRID_STREAM: &[u8] = b"|hybrid-stream|";

const LABEL_ENC: &[u8] = b"enc";
const LABEL_MAC: &[u8] = b"mac";

/// Encryption and authentication subkeys derived from one secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StreamKeys {
    pub enc: [u8; 32],
    pub mac: [u8; 32],
}

pub fn sha3_digest(data: &[u8]) -> [u8; 32] {
    let h = Sha3_256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h);
    out
}

/// 32 bytes of HKDF-SHA256 output bound to `context` and `label`.
pub fn derive(ikm: &[u8], context: &[u8], label: &[u8]) -> [u8; 32] {
    let mut info = Vec::with_capacity(PROTOCOL_ID.len() + context.len() + label.len());
    info.extend_from_slice(PROTOCOL_ID);
    info.extend_from_slice(context);
    info.extend_from_slice(label);

    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut out = [0u8; 32];
    // 32 bytes is far below the 255 * HashLen limit, so expand cannot fail.
    let _ = hk.expand(&info, &mut out);
    out
}

/// Split a secret into independent encryption and MAC keys.
pub fn stream_keys(secret: &[u8], context: &[u8]) -> StreamKeys {
    StreamKeys {
        enc: derive(secret, context, LABEL_ENC),
        mac: derive(secret, context, LABEL_MAC),
    }
}
