//! Simulated hybrid KEM
//!
//! Stands in for a lattice KEM behind [`KemProvider`] so a real one can be
//! dropped in without touching envelope framing. Nothing here is a real
//! encapsulation: the ciphertext is random bytes and the shared secret is
//! recomputed from the seed and a hash of the ciphertext prefix.
//!
//! Seed layout (96 bytes):
//!   key_seed[64] || mix[32]
//!
//!   private = HKDF(key_seed, "|kem-private|")
//!   public  = HKDF(key_seed, "|kem-public|")
//!
//! KEM ciphertext (1088 bytes):
//!   ephemeral[64] || (random[32] XOR mix) || random[992]
//!
//! Shared secret:
//!   HKDF(private, "|kem-shared|" || SHA3-256(public || ephemeral))

use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::EngineError;
use crate::kdf::{self, CTX_KEM_PRIVATE, CTX_KEM_PUBLIC, CTX_KEM_SHARED};
use crate::wire::NONCE_BYTES;

pub const KEM_SEED_BYTES: usize = 96;
pub const KEM_CIPHERTEXT_BYTES: usize = 1088;
pub const SHARED_SECRET_BYTES: usize = 32;

const KEY_SEED_BYTES: usize = 64;
const EPHEMERAL_BYTES: usize = 64;
const MIX_BYTES: usize = KEM_SEED_BYTES - KEY_SEED_BYTES;

pub type SharedSecret = Zeroizing<[u8; SHARED_SECRET_BYTES]>;

/// Output of [`KemProvider::encapsulate`].
pub struct Encapsulation {
    pub shared_secret: SharedSecret,
    pub kem_ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_BYTES],
}

/// Narrow KEM interface used by the hybrid level.
pub trait KemProvider: Send + Sync {
    /// Key material the provider needs from the key service.
    fn seed_bytes(&self) -> usize;
    fn ciphertext_bytes(&self) -> usize;
    fn encapsulate(&self, seed: &[u8]) -> Result<Encapsulation, EngineError>;
    /// Must return the same secret `encapsulate` did for this seed and ciphertext.
    fn decapsulate(&self, seed: &[u8], kem_ciphertext: &[u8]) -> Result<SharedSecret, EngineError>;
}

// ---------------------------------------------------------------------------
// Simulated provider
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct SimulatedKem;

struct Keypair {
    private: Zeroizing<[u8; 32]>,
    public: [u8; 32],
}

impl SimulatedKem {
    fn keypair(seed: &[u8]) -> Result<Keypair, EngineError> {
        if seed.len() != KEM_SEED_BYTES {
            return Err(EngineError::MalformedEnvelope("kem seed length"));
        }
        let key_seed = &seed[..KEY_SEED_BYTES];
        Ok(Keypair {
            private: Zeroizing::new(kdf::derive(key_seed, CTX_KEM_PRIVATE, b"")),
            public: kdf::derive(key_seed, CTX_KEM_PUBLIC, b""),
        })
    }

    fn shared_secret(keys: &Keypair, kem_ciphertext: &[u8]) -> SharedSecret {
        let mut transcript = Vec::with_capacity(32 + EPHEMERAL_BYTES);
        transcript.extend_from_slice(&keys.public);
        transcript.extend_from_slice(&kem_ciphertext[..EPHEMERAL_BYTES]);
        let digest = kdf::sha3_digest(&transcript);
        Zeroizing::new(kdf::derive(keys.private.as_slice(), CTX_KEM_SHARED, &digest))
    }
}

impl KemProvider for SimulatedKem {
    fn seed_bytes(&self) -> usize {
        KEM_SEED_BYTES
    }

    fn ciphertext_bytes(&self) -> usize {
        KEM_CIPHERTEXT_BYTES
    }

    fn encapsulate(&self, seed: &[u8]) -> Result<Encapsulation, EngineError> {
        let keys = Self::keypair(seed)?;

        let mut kem_ciphertext = vec![0u8; KEM_CIPHERTEXT_BYTES];
        OsRng.fill_bytes(&mut kem_ciphertext);
        let mix = &mut kem_ciphertext[EPHEMERAL_BYTES..EPHEMERAL_BYTES + MIX_BYTES];
        for (b, s) in mix.iter_mut().zip(&seed[KEY_SEED_BYTES..]) {
            *b ^= s;
        }

        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        Ok(Encapsulation {
            shared_secret: Self::shared_secret(&keys, &kem_ciphertext),
            kem_ciphertext,
            nonce,
        })
    }

    fn decapsulate(&self, seed: &[u8], kem_ciphertext: &[u8]) -> Result<SharedSecret, EngineError> {
        if kem_ciphertext.len() != KEM_CIPHERTEXT_BYTES {
            return Err(EngineError::MalformedEnvelope("kem ciphertext length"));
        }
        let keys = Self::keypair(seed)?;
        Ok(Self::shared_secret(&keys, kem_ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<u8> {
        (0..KEM_SEED_BYTES as u8).collect()
    }

    #[test]
    fn decapsulate_recovers_shared_secret() {
        let kem = SimulatedKem;
        let enc = kem.encapsulate(&seed()).unwrap();
        assert_eq!(enc.kem_ciphertext.len(), KEM_CIPHERTEXT_BYTES);
        let ss = kem.decapsulate(&seed(), &enc.kem_ciphertext).unwrap();
        assert_eq!(*ss, *enc.shared_secret);
    }

    #[test]
    fn encapsulations_are_fresh() {
        let kem = SimulatedKem;
        let a = kem.encapsulate(&seed()).unwrap();
        let b = kem.encapsulate(&seed()).unwrap();
        assert_ne!(a.kem_ciphertext, b.kem_ciphertext);
        assert_ne!(*a.shared_secret, *b.shared_secret);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn wrong_seed_gives_different_secret() {
        let kem = SimulatedKem;
        let enc = kem.encapsulate(&seed()).unwrap();
        let mut other = seed();
        other[0] ^= 1;
        let ss = kem.decapsulate(&other, &enc.kem_ciphertext).unwrap();
        assert_ne!(*ss, *enc.shared_secret);
    }

    #[test]
    fn lengths_are_checked() {
        let kem = SimulatedKem;
        assert!(kem.encapsulate(&[0u8; 32]).is_err());
        assert!(kem.decapsulate(&seed(), &[0u8; 100]).is_err());
    }
}
