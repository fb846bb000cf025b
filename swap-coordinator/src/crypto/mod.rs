pub mod adaptor;
pub mod destination;
pub mod signing;

use crate::data_structures::{AdaptorPoint, Commitment, Destination, Secret, SwapId};
pub use adaptor::{AdaptorMaterial, AdaptorSignature};
use thiserror::Error;

// Why a reveal submission was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("signature is not in canonical form: {0}")]
    NonCanonical(&'static str),
    #[error("adaptor point is not a valid non-identity curve point")]
    InvalidPoint,
    #[error("extracted secret does not link to the adaptor point")]
    DiscreteLogMismatch,
    #[error("extracted secret does not open the swap commitment")]
    CommitmentMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),
    #[error("secret scalar is zero")]
    ZeroSecret,
}

/// Pure cryptographic operations the coordinator depends on.
pub trait CryptoCapability: Send + Sync {
    fn verify_adaptor_signature(
        &self,
        sig: &AdaptorSignature,
        point: &AdaptorPoint,
        commitment: &Commitment,
    ) -> Result<Secret, VerificationError>;

    fn commit(&self, secret: &Secret) -> Commitment;

    fn derive_one_time_destination(
        &self,
        owner_key: &[u8; 32],
        counterparty_key: &[u8; 32],
        swap_id: &SwapId,
    ) -> Result<Destination, CryptoError>;
}

// Reference capability over Ed25519 (curve25519-dalek)
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Adaptor;

impl CryptoCapability for Ed25519Adaptor {
    fn verify_adaptor_signature(
        &self,
        sig: &AdaptorSignature,
        point: &AdaptorPoint,
        commitment: &Commitment,
    ) -> Result<Secret, VerificationError> {
        adaptor::verify_adaptor_signature(sig, point, commitment)
    }

    fn commit(&self, secret: &Secret) -> Commitment {
        adaptor::commit(secret)
    }

    fn derive_one_time_destination(
        &self,
        owner_key: &[u8; 32],
        counterparty_key: &[u8; 32],
        swap_id: &SwapId,
    ) -> Result<Destination, CryptoError> {
        destination::derive_one_time_destination(owner_key, counterparty_key, swap_id)
    }
}
