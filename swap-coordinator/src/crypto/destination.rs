// One-time target-ledger destination, stealth sub-address style:
// b = H512(domain || owner || counterparty || swap_id) mod l,
// destination = (owner + b·G, counterparty + b·G).

use crate::crypto::CryptoError;
use crate::data_structures::{Destination, SwapId};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha512};

const DESTINATION_DOMAIN: &[u8] = b"swap-coordinator/one-time-destination/v1";

pub fn derive_one_time_destination(
    owner_key: &[u8; 32],
    counterparty_key: &[u8; 32],
    swap_id: &SwapId,
) -> Result<Destination, CryptoError> {
    let owner = decompress_key(owner_key, "owner key is not a curve point")?;
    let counterparty = decompress_key(counterparty_key, "counterparty key is not a curve point")?;

    let blinding = blinding_factor(owner_key, counterparty_key, swap_id);
    let offset = EdwardsPoint::mul_base(&blinding);

    Ok(Destination {
        spend_key: (owner + offset).compress().to_bytes(),
        view_key: (counterparty + offset).compress().to_bytes(),
    })
}

fn blinding_factor(owner_key: &[u8; 32], counterparty_key: &[u8; 32], swap_id: &SwapId) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(DESTINATION_DOMAIN);
    hasher.update(owner_key);
    hasher.update(counterparty_key);
    hasher.update(swap_id.as_bytes());
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn decompress_key(bytes: &[u8; 32], what: &'static str) -> Result<EdwardsPoint, CryptoError> {
    CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(CryptoError::InvalidKey(what))
}
