// swap-coordinator/src/crypto/signing.rs
//
// Ed25519 helpers for the coordinator's instruction key and the block-data
// oracle's fraud attestations.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Generates a new Ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    let mut csprng = OsRng;
    SigningKey::generate(&mut csprng)
}

/// Deterministic key from a 32-byte seed, for operator-provisioned keys.
pub fn keypair_from_seed(seed: &[u8; 32]) -> SigningKey {
    SigningKey::from_bytes(seed)
}

/// Signs a message with an Ed25519 secret key.
pub fn sign(message: &[u8], key: &SigningKey) -> Signature {
    key.sign(message)
}

/// Verifies an Ed25519 signature. Uses strict verification so malleated
/// signatures are rejected.
pub fn verify(message: &[u8], signature: &Signature, public_key: &VerifyingKey) -> bool {
    public_key.verify_strict(message, signature).is_ok()
}
