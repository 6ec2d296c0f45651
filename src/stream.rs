//! Hash-chain keystream and HMAC tags
//!
//! block[i] = SHA-256(key || nonce || i as u64 big-endian)
//! ct       = pt XOR (block[0] || block[1] || ...)
//! tag      = HMAC-SHA256(mac_key, part[0] || part[1] || ...)

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::wire::{NONCE_BYTES, TAG_BYTES};

type HmacSha256 = Hmac<Sha256>;

const BLOCK_BYTES: usize = 32;

/// XOR `data` in place with the keystream for `(key, nonce)`.
///
/// Applying it twice restores the input.
pub fn apply_keystream(key: &[u8; 32], nonce: &[u8; NONCE_BYTES], data: &mut [u8]) {
    let mut block = [0u8; BLOCK_BYTES];
    for (counter, chunk) in data.chunks_mut(BLOCK_BYTES).enumerate() {
        let mut h = Sha256::new();
        h.update(key);
        h.update(nonce);
        h.update((counter as u64).to_be_bytes());
        block.copy_from_slice(&h.finalize());
        xor_in_place(chunk, &block);
    }
    block.zeroize();
}

/// XOR `data` in place with `pad`. `pad` must be at least as long as `data`.
pub fn xor_in_place(data: &mut [u8], pad: &[u8]) {
    for (d, p) in data.iter_mut().zip(pad) {
        *d ^= p;
    }
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn tag(mac_key: &[u8], parts: &[&[u8]]) -> [u8; TAG_BYTES] {
    // HMAC accepts keys of any length.
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(mac_key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; TAG_BYTES],
    };
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; TAG_BYTES];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time tag check.
pub fn verify_tag(mac_key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    let computed = tag(mac_key, parts);
    computed[..].ct_eq(expected).into()
}
