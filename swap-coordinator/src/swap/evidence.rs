// Observations about the target ledger: lock confirmations and
// oracle-attested fraud proofs.

use crate::crypto::signing::{sign, verify};
use crate::data_structures::{Destination, OutputRef, SwapId, TxRef};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

const FRAUD_PROOF_DOMAIN: &[u8] = b"swap-coordinator/fraud-proof/v1";

// Funds observed at the swap's one-time destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvidence {
    pub swap_id: SwapId,
    pub lock_ref: OutputRef,
    pub destination: Destination,
    pub amount: u64,
    pub confirmations: u64,
    pub reorg_depth: u64, // deepest reorg seen below the lock so far
}

// The output that replaced the original lock after a reorg
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplacementOutput {
    pub tx_ref: TxRef,
    pub recipient_key: [u8; 32],
    pub height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudProof {
    pub swap_id: SwapId,
    pub original: OutputRef,
    pub replacement: ReplacementOutput,
    pub reorg_depth: u64,
    // block-data oracle signature over attested_bytes()
    pub attestation: Signature,
}

impl FraudProof {
    /// Builds a proof signed by the oracle key.
    pub fn attest(
        swap_id: SwapId,
        original: OutputRef,
        replacement: ReplacementOutput,
        reorg_depth: u64,
        oracle_key: &SigningKey,
    ) -> Self {
        let data = attested_bytes(&swap_id, &original, &replacement, reorg_depth);
        FraudProof {
            swap_id,
            original,
            replacement,
            reorg_depth,
            attestation: sign(&data, oracle_key),
        }
    }

    /// Reconstructs the signed bytes and checks them against the oracle key.
    pub fn verify(&self, oracle_key: &VerifyingKey) -> bool {
        let data = attested_bytes(&self.swap_id, &self.original, &self.replacement, self.reorg_depth);
        verify(&data, &self.attestation, oracle_key)
    }

    /// True when the reorg sent the locked funds back to `lock_owner_key`.
    pub fn is_attributable_to(&self, lock_owner_key: &[u8; 32]) -> bool {
        self.replacement.recipient_key == *lock_owner_key
    }
}

fn attested_bytes(
    swap_id: &SwapId,
    original: &OutputRef,
    replacement: &ReplacementOutput,
    reorg_depth: u64,
) -> Vec<u8> {
    let mut data = FRAUD_PROOF_DOMAIN.to_vec();
    data.extend_from_slice(swap_id.as_bytes());
    push_str(&mut data, &original.tx_id);
    data.extend_from_slice(&original.index.to_le_bytes());
    push_str(&mut data, &replacement.tx_ref.0);
    data.extend_from_slice(&replacement.recipient_key);
    data.extend_from_slice(&replacement.height.to_le_bytes());
    data.extend_from_slice(&reorg_depth.to_le_bytes());
    data
}

// length-prefixed so adjacent strings cannot be shifted into each other
fn push_str(data: &mut Vec<u8>, s: &str) {
    data.extend_from_slice(&(s.len() as u64).to_le_bytes());
    data.extend_from_slice(s.as_bytes());
}
