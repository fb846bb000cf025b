// Adaptor signatures over Ed25519.
//
// A completed signature is (R, s, parity) with s = t + e, where
// e = H512(domain || R || T || commitment) mod l and T = t·G. Publishing it
// discloses t = s - e. Exactly one encoding is accepted: s must be reduced,
// R must be a canonical point encoding, and parity must equal the sign bit
// of T and of the recovered t·G. The negated form (R, 2e - s, parity ^ 1)
// recovers -t and is always rejected.

use crate::crypto::{CryptoError, VerificationError};
use crate::data_structures::{AdaptorPoint, Commitment, Secret};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

const CHALLENGE_DOMAIN: &[u8] = b"swap-coordinator/adaptor-challenge/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdaptorSignature {
    pub nonce: [u8; 32], // compressed R
    pub s: [u8; 32],     // little-endian scalar
    pub parity: u8,      // sign bit of T
}

// Secret, point and commitment generated together by the party that will
// later redeem.
#[derive(Clone, Debug)]
pub struct AdaptorMaterial {
    pub secret: Secret,
    pub point: AdaptorPoint,
    pub commitment: Commitment,
}

impl AdaptorMaterial {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        loop {
            let t = random_scalar(rng);
            if t == Scalar::ZERO {
                continue;
            }
            return Self::from_scalar(t);
        }
    }

    pub fn from_secret(secret: &Secret) -> Result<Self, CryptoError> {
        let t = secret_scalar(secret)?;
        Ok(Self::from_scalar(t))
    }

    fn from_scalar(t: Scalar) -> Self {
        let secret = Secret(t.to_bytes());
        AdaptorMaterial {
            point: AdaptorPoint(EdwardsPoint::mul_base(&t).compress().to_bytes()),
            commitment: commit(&secret),
            secret,
        }
    }

    /// Completes an adaptor signature with the held secret.
    pub fn complete<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<AdaptorSignature, CryptoError> {
        let t = secret_scalar(&self.secret)?;
        let r = random_scalar(rng);
        let nonce = EdwardsPoint::mul_base(&r).compress().to_bytes();
        let e = challenge(&nonce, &self.point, &self.commitment);
        Ok(AdaptorSignature {
            nonce,
            s: (t + e).to_bytes(),
            parity: sign_bit(&self.point.0),
        })
    }
}

impl AdaptorSignature {
    /// The other encoding of the same (R, |t|) pair: s' = 2e - s with the
    /// parity bit flipped. It recovers -t, so it never verifies against T.
    pub fn negated(&self, point: &AdaptorPoint, commitment: &Commitment) -> AdaptorSignature {
        let e = challenge(&self.nonce, point, commitment);
        let s = Scalar::from_bytes_mod_order(self.s);
        AdaptorSignature {
            nonce: self.nonce,
            s: (e + e - s).to_bytes(),
            parity: self.parity ^ 1,
        }
    }
}

/// SHA-256 of the canonical secret encoding.
pub fn commit(secret: &Secret) -> Commitment {
    let digest = Sha256::digest(secret.0);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Commitment(out)
}

/// Decompresses an adaptor point, rejecting the identity.
pub fn decompress_point(point: &AdaptorPoint) -> Result<EdwardsPoint, VerificationError> {
    let decoded = CompressedEdwardsY(point.0)
        .decompress()
        .ok_or(VerificationError::InvalidPoint)?;
    if decoded.is_identity() {
        return Err(VerificationError::InvalidPoint);
    }
    Ok(decoded)
}

pub fn verify_adaptor_signature(
    sig: &AdaptorSignature,
    point: &AdaptorPoint,
    commitment: &Commitment,
) -> Result<Secret, VerificationError> {
    // Canonical form first
    if sig.parity > 1 {
        return Err(VerificationError::NonCanonical("parity must be 0 or 1"));
    }
    if sig.nonce == [0u8; 32] || sig.s == [0u8; 32] {
        return Err(VerificationError::NonCanonical("zero signature component"));
    }
    let s: Option<Scalar> = Scalar::from_canonical_bytes(sig.s).into();
    let s = s.ok_or(VerificationError::NonCanonical("s is not reduced mod l"))?;
    let nonce_point = CompressedEdwardsY(sig.nonce)
        .decompress()
        .ok_or(VerificationError::NonCanonical("nonce is not a curve point"))?;
    if nonce_point.compress().to_bytes() != sig.nonce {
        return Err(VerificationError::NonCanonical("nonce encoding is not canonical"));
    }
    decompress_point(point)?;
    if sig.parity != sign_bit(&point.0) {
        return Err(VerificationError::NonCanonical("parity does not match the adaptor point"));
    }

    // Linkage: t·G must equal T
    let e = challenge(&sig.nonce, point, commitment);
    let t = s - e;
    if t == Scalar::ZERO {
        return Err(VerificationError::DiscreteLogMismatch);
    }
    let recovered = EdwardsPoint::mul_base(&t).compress().to_bytes();
    if y_coordinate(&recovered) != y_coordinate(&point.0) {
        return Err(VerificationError::DiscreteLogMismatch);
    }
    if sign_bit(&recovered) != sig.parity {
        return Err(VerificationError::NonCanonical("recovered secret has the wrong sign"));
    }

    let secret = Secret(t.to_bytes());
    if commit(&secret) != *commitment {
        return Err(VerificationError::CommitmentMismatch);
    }
    Ok(secret)
}

fn challenge(nonce: &[u8; 32], point: &AdaptorPoint, commitment: &Commitment) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(CHALLENGE_DOMAIN);
    hasher.update(nonce);
    hasher.update(point.0);
    hasher.update(commitment.0);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub(crate) fn secret_scalar(secret: &Secret) -> Result<Scalar, CryptoError> {
    let t: Option<Scalar> = Scalar::from_canonical_bytes(secret.0).into();
    match t {
        Some(t) if t != Scalar::ZERO => Ok(t),
        Some(_) => Err(CryptoError::ZeroSecret),
        None => Err(CryptoError::InvalidKey("secret is not a reduced scalar")),
    }
}

fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn sign_bit(compressed: &[u8; 32]) -> u8 {
    compressed[31] >> 7
}

fn y_coordinate(compressed: &[u8; 32]) -> [u8; 32] {
    let mut y = *compressed;
    y[31] &= 0x7f;
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    // l = 2^252 + 27742317777372353535851937790883648493, little-endian
    const GROUP_ORDER: [u8; 32] = [
        0xed, 0xd3, 0xf5, 0x5c, 0x1a, 0x63, 0x12, 0x58, 0xd6, 0x9c, 0xf7, 0xa2, 0xde, 0xf9, 0xde, 0x14,
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x10,
    ];

    fn add_group_order(s: &[u8; 32]) -> Option<[u8; 32]> {
        let mut out = [0u8; 32];
        let mut carry = 0u16;
        for i in 0..32 {
            let sum = s[i] as u16 + GROUP_ORDER[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        if carry == 0 { Some(out) } else { None }
    }

    #[test]
    fn completed_signature_reveals_secret() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let sig = material.complete(&mut OsRng).unwrap();
        let secret = verify_adaptor_signature(&sig, &material.point, &material.commitment).unwrap();
        assert_eq!(secret, material.secret);
        assert_eq!(commit(&secret), material.commitment);
    }

    #[test]
    fn exactly_one_of_signature_and_negation_verifies() {
        for _ in 0..32 {
            let material = AdaptorMaterial::generate(&mut OsRng);
            let sig = material.complete(&mut OsRng).unwrap();
            let neg = sig.negated(&material.point, &material.commitment);
            let ok = verify_adaptor_signature(&sig, &material.point, &material.commitment).is_ok();
            let neg_ok = verify_adaptor_signature(&neg, &material.point, &material.commitment).is_ok();
            assert!(ok ^ neg_ok);
            assert!(ok);
        }
    }

    #[test]
    fn negated_scalar_without_parity_flip_is_non_canonical() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let sig = material.complete(&mut OsRng).unwrap();
        let mut neg = sig.negated(&material.point, &material.commitment);
        neg.parity = sig.parity;
        let err = verify_adaptor_signature(&neg, &material.point, &material.commitment).unwrap_err();
        assert!(matches!(err, VerificationError::NonCanonical(_)));
    }

    #[test]
    fn unreduced_s_is_rejected_before_linkage() {
        // s + l encodes the same scalar but is not canonical
        for _ in 0..64 {
            let material = AdaptorMaterial::generate(&mut OsRng);
            let mut sig = material.complete(&mut OsRng).unwrap();
            if let Some(wide) = add_group_order(&sig.s) {
                sig.s = wide;
                let err = verify_adaptor_signature(&sig, &material.point, &material.commitment).unwrap_err();
                assert!(matches!(err, VerificationError::NonCanonical(_)));
                return;
            }
        }
        panic!("no signature with room for s + l found");
    }

    #[test]
    fn out_of_range_parity_rejected() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let mut sig = material.complete(&mut OsRng).unwrap();
        sig.parity = 2;
        assert!(matches!(
            verify_adaptor_signature(&sig, &material.point, &material.commitment),
            Err(VerificationError::NonCanonical(_))
        ));
    }

    #[test]
    fn zero_components_rejected() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let mut sig = material.complete(&mut OsRng).unwrap();
        sig.s = [0u8; 32];
        assert!(matches!(
            verify_adaptor_signature(&sig, &material.point, &material.commitment),
            Err(VerificationError::NonCanonical(_))
        ));
    }

    #[test]
    fn signature_for_other_point_fails_linkage() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let other = AdaptorMaterial::generate(&mut OsRng);
        let mut sig = other.complete(&mut OsRng).unwrap();
        // keep the parity consistent with the point under test so the
        // canonical checks pass and linkage is what fails
        sig.parity = material.point.0[31] >> 7;
        let err = verify_adaptor_signature(&sig, &material.point, &material.commitment).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::DiscreteLogMismatch | VerificationError::NonCanonical(_)
        ));
        assert_ne!(err, VerificationError::CommitmentMismatch);
    }

    #[test]
    fn wrong_commitment_is_commitment_mismatch() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let forged = Commitment([9u8; 32]);
        // signer binds the forged commitment into the challenge, so linkage
        // holds but the recovered secret does not open it
        let t = secret_scalar(&material.secret).unwrap();
        let r = random_scalar(&mut OsRng);
        let nonce = EdwardsPoint::mul_base(&r).compress().to_bytes();
        let e = challenge(&nonce, &material.point, &forged);
        let sig = AdaptorSignature {
            nonce,
            s: (t + e).to_bytes(),
            parity: sign_bit(&material.point.0),
        };
        assert_eq!(
            verify_adaptor_signature(&sig, &material.point, &forged),
            Err(VerificationError::CommitmentMismatch)
        );
    }

    #[test]
    fn identity_point_rejected() {
        let identity = AdaptorPoint(EdwardsPoint::mul_base(&Scalar::ZERO).compress().to_bytes());
        assert_eq!(decompress_point(&identity), Err(VerificationError::InvalidPoint));
    }

    #[test]
    fn material_round_trips_from_secret() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let again = AdaptorMaterial::from_secret(&material.secret).unwrap();
        assert_eq!(again.point, material.point);
        assert_eq!(again.commitment, material.commitment);
        assert!(matches!(
            AdaptorMaterial::from_secret(&Secret([0u8; 32])),
            Err(CryptoError::ZeroSecret)
        ));
    }
}
