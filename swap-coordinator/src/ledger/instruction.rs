// Tagged ledger instructions issued by the state machine and signed by the
// coordinator before they reach an executor.

use crate::crypto::signing::{sign, verify};
use crate::crypto::AdaptorSignature;
use crate::data_structures::{Destination, LedgerId, Secret, SwapId, TxRef};
use crate::ledger::interface::{LedgerError, LedgerExecutor};
use crate::swap::evidence::FraudProof;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerInstruction {
    // Fund a leg. Target-ledger locks pay to the one-time destination.
    Lock {
        ledger: LedgerId,
        swap_id: SwapId,
        amount: u64,
        destination: Option<Destination>,
    },
    // Base-ledger release to the redeemer, disclosing the secret
    Reveal {
        swap_id: SwapId,
        secret: Secret,
        signature: AdaptorSignature,
        payout: Payout,
    },
    // Base-ledger collateral back to the counterparty once the reveal settled
    ReturnCollateral {
        swap_id: SwapId,
    },
    Refund {
        ledger: LedgerId,
        swap_id: SwapId,
    },
    // Base-ledger collateral transfer to the fraud victim
    Forfeit {
        swap_id: SwapId,
        proof: FraudProof,
    },
}

// How a redeemed base leg is split. The relayer fee comes out of the
// base amount; the redeemer gets the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub redeemer: String,
    pub amount: u64,
    pub relayer: Option<String>,
    pub relayer_fee: u64,
}

impl Payout {
    pub fn total(&self) -> u64 {
        self.amount.saturating_add(self.relayer_fee)
    }
}

impl LedgerInstruction {
    pub fn ledger(&self) -> LedgerId {
        match self {
            LedgerInstruction::Lock { ledger, .. } => *ledger,
            LedgerInstruction::Reveal { .. } => LedgerId::Base,
            LedgerInstruction::ReturnCollateral { .. } => LedgerId::Base,
            LedgerInstruction::Refund { ledger, .. } => *ledger,
            LedgerInstruction::Forfeit { .. } => LedgerId::Base,
        }
    }

    pub fn swap_id(&self) -> SwapId {
        match self {
            LedgerInstruction::Lock { swap_id, .. }
            | LedgerInstruction::Reveal { swap_id, .. }
            | LedgerInstruction::ReturnCollateral { swap_id }
            | LedgerInstruction::Refund { swap_id, .. }
            | LedgerInstruction::Forfeit { swap_id, .. } => *swap_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerInstruction::Lock { .. } => "lock",
            LedgerInstruction::Reveal { .. } => "reveal",
            LedgerInstruction::ReturnCollateral { .. } => "return_collateral",
            LedgerInstruction::Refund { .. } => "refund",
            LedgerInstruction::Forfeit { .. } => "forfeit",
        }
    }

    /// Shape checks applied at the executor boundary.
    pub fn validate(&self) -> Result<(), LedgerError> {
        match self {
            LedgerInstruction::Lock { ledger, amount, destination, .. } => {
                if *amount == 0 {
                    return Err(LedgerError::InvalidInstruction("lock amount is zero".into()));
                }
                match (ledger, destination) {
                    (LedgerId::Target, None) => Err(LedgerError::InvalidInstruction(
                        "target lock needs a one-time destination".into(),
                    )),
                    (LedgerId::Base, Some(_)) => Err(LedgerError::InvalidInstruction(
                        "base lock does not take a destination".into(),
                    )),
                    _ => Ok(()),
                }
            }
            LedgerInstruction::Reveal { swap_id, secret, payout, .. } => {
                if secret.0 == [0u8; 32] {
                    return Err(LedgerError::InvalidInstruction(format!("zero secret for swap {}", swap_id)));
                }
                if payout.amount == 0 {
                    return Err(LedgerError::InvalidInstruction("redeemer payout is zero".into()));
                }
                if payout.relayer_fee > 0 && payout.relayer.is_none() {
                    return Err(LedgerError::InvalidInstruction("relayer fee without a relayer".into()));
                }
                Ok(())
            }
            LedgerInstruction::ReturnCollateral { .. } | LedgerInstruction::Refund { .. } => Ok(()),
            LedgerInstruction::Forfeit { swap_id, proof } => {
                if proof.swap_id != *swap_id {
                    return Err(LedgerError::InvalidInstruction("fraud proof is for another swap".into()));
                }
                Ok(())
            }
        }
    }
}

// An instruction with the coordinator's signature over its JSON encoding
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedInstruction {
    pub instruction: LedgerInstruction,
    pub signer: VerifyingKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedInstruction {
    pub fn sign(instruction: LedgerInstruction, key: &SigningKey) -> Result<Self, LedgerError> {
        let payload = signing_payload(&instruction)?;
        Ok(SignedInstruction {
            signature: sign(&payload, key).to_bytes().to_vec(),
            signer: key.verifying_key(),
            instruction,
        })
    }

    pub fn verify(&self, expected_signer: &VerifyingKey) -> Result<(), LedgerError> {
        if self.signer != *expected_signer {
            return Err(LedgerError::BadSignature);
        }
        let signature = Signature::from_slice(&self.signature).map_err(|_| LedgerError::BadSignature)?;
        let payload = signing_payload(&self.instruction)?;
        if verify(&payload, &signature, expected_signer) {
            Ok(())
        } else {
            Err(LedgerError::BadSignature)
        }
    }
}

fn signing_payload(instruction: &LedgerInstruction) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec(instruction).map_err(|e| LedgerError::InvalidInstruction(e.to_string()))
}

/// Checks signature, shape and ledger, then routes to the executor.
pub async fn dispatch_instruction(
    signed: &SignedInstruction,
    expected_signer: &VerifyingKey,
    executor: &dyn LedgerExecutor,
) -> Result<TxRef, LedgerError> {
    signed.verify(expected_signer)?;
    let instruction = &signed.instruction;
    instruction.validate()?;
    if instruction.ledger() != executor.ledger() {
        return Err(LedgerError::WrongLedger {
            instruction: instruction.ledger(),
            executor: executor.ledger(),
        });
    }
    match instruction {
        LedgerInstruction::Lock { swap_id, amount, destination, .. } => {
            executor.submit_lock(swap_id, *amount, destination.as_ref()).await
        }
        LedgerInstruction::Reveal { swap_id, secret, signature, payout } => {
            executor.submit_reveal(swap_id, secret, signature, payout).await
        }
        LedgerInstruction::ReturnCollateral { swap_id } => executor.submit_collateral_return(swap_id).await,
        LedgerInstruction::Refund { swap_id, .. } => executor.submit_refund(swap_id).await,
        LedgerInstruction::Forfeit { swap_id, proof } => executor.submit_forfeit(swap_id, proof).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing::keypair_from_seed;
    use crate::crypto::AdaptorMaterial;
    use crate::ledger::mock::{MockExecutor, SubmissionKind};
    use rand::rngs::OsRng;

    fn refund(ledger: LedgerId) -> LedgerInstruction {
        LedgerInstruction::Refund { ledger, swap_id: SwapId([5u8; 32]) }
    }

    #[test]
    fn instructions_serialize_with_op_tag() {
        let json = serde_json::to_value(refund(LedgerId::Base)).unwrap();
        assert_eq!(json["op"], "refund");
        assert_eq!(json["ledger"], "Base");
    }

    #[test]
    fn lock_shape_is_checked() {
        let base_with_destination = LedgerInstruction::Lock {
            ledger: LedgerId::Base,
            swap_id: SwapId([1u8; 32]),
            amount: 100,
            destination: Some(Destination { spend_key: [1u8; 32], view_key: [2u8; 32] }),
        };
        assert!(base_with_destination.validate().is_err());

        let target_without_destination = LedgerInstruction::Lock {
            ledger: LedgerId::Target,
            swap_id: SwapId([1u8; 32]),
            amount: 1,
            destination: None,
        };
        assert!(target_without_destination.validate().is_err());

        let zero = LedgerInstruction::Lock {
            ledger: LedgerId::Base,
            swap_id: SwapId([1u8; 32]),
            amount: 0,
            destination: None,
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn reveal_payout_shape_is_checked() {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let signature = material.complete(&mut OsRng).unwrap();
        let reveal = |payout: Payout| LedgerInstruction::Reveal {
            swap_id: SwapId([1u8; 32]),
            secret: material.secret,
            signature,
            payout,
        };

        let split = Payout { redeemer: "0xbob".into(), amount: 95, relayer: Some("0xrelay".into()), relayer_fee: 5 };
        assert_eq!(split.total(), 100);
        assert!(reveal(split.clone()).validate().is_ok());

        let orphan_fee = Payout { relayer: None, ..split.clone() };
        assert!(reveal(orphan_fee).validate().is_err());

        let nothing_left = Payout { amount: 0, ..split };
        assert!(reveal(nothing_left).validate().is_err());
    }

    #[test]
    fn signature_binds_instruction_and_signer() {
        let key = keypair_from_seed(&[1u8; 32]);
        let signed = SignedInstruction::sign(refund(LedgerId::Base), &key).unwrap();
        assert!(signed.verify(&key.verifying_key()).is_ok());

        let other = keypair_from_seed(&[2u8; 32]);
        assert_eq!(signed.verify(&other.verifying_key()), Err(LedgerError::BadSignature));

        let mut tampered = signed.clone();
        tampered.instruction = refund(LedgerId::Target);
        assert_eq!(tampered.verify(&key.verifying_key()), Err(LedgerError::BadSignature));
    }

    #[tokio::test]
    async fn dispatch_routes_to_matching_executor() {
        let key = keypair_from_seed(&[1u8; 32]);
        let executor = MockExecutor::new(LedgerId::Base);
        let signed = SignedInstruction::sign(refund(LedgerId::Base), &key).unwrap();

        let first = dispatch_instruction(&signed, &key.verifying_key(), &executor).await.unwrap();
        let again = dispatch_instruction(&signed, &key.verifying_key(), &executor).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(executor.count(SubmissionKind::Refund, &SwapId([5u8; 32])), 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_wrong_ledger() {
        let key = keypair_from_seed(&[1u8; 32]);
        let executor = MockExecutor::new(LedgerId::Target);
        let signed = SignedInstruction::sign(refund(LedgerId::Base), &key).unwrap();
        let err = dispatch_instruction(&signed, &key.verifying_key(), &executor).await.unwrap_err();
        assert!(matches!(err, LedgerError::WrongLedger { .. }));
        assert!(executor.submissions().is_empty());
    }
}
