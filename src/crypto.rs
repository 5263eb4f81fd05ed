//! Hashing and Ed25519 identities
//!
//! Content hashes are SHA3-256. VDF challenges use SHA-256 of the VRF seed.

use crate::types::{Hash, PublicKey, Signature};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

// ============================================================================
// TRAITS FOR CRYPTO ABSTRACTION
// ============================================================================

/// Trait for signing operations
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Signature;
    fn public_key(&self) -> PublicKey;
}

/// Trait for verification operations
pub trait Verifier: Send + Sync {
    fn verify(&self, pubkey: &PublicKey, message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 key pair
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut OsRng) }
    }

    /// Deterministic key from a 32-byte seed (tests, devnet)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", hex::encode(&self.public_key()[..8]))
    }
}

impl Signer for Keypair {
    fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message).to_bytes().to_vec()
    }

    fn public_key(&self) -> PublicKey {
        self.signing.verifying_key().to_bytes()
    }
}

/// Verifies Ed25519 signatures
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, pubkey: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(pubkey) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::from_seed(&[7u8; 32]);
        let sig = kp.sign(b"block");
        assert_eq!(sig.len(), 64);
        assert!(Ed25519Verifier.verify(&kp.public_key(), b"block", &sig));
        assert!(!Ed25519Verifier.verify(&kp.public_key(), b"other", &sig));
        assert!(!Ed25519Verifier.verify(&kp.public_key(), b"block", &sig[..10]));
    }

    #[test]
    fn test_generated_keys_are_distinct() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        assert_ne!(a.public_key(), b.public_key());
        let sig = a.sign(b"seed");
        assert!(Ed25519Verifier.verify(&a.public_key(), b"seed", &sig));
        assert!(!Ed25519Verifier.verify(&b.public_key(), b"seed", &sig));
    }

    #[test]
    fn test_hashes_differ() {
        assert_ne!(sha3(b"pulsar"), sha256(b"pulsar"));
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
