// Swap record, lifecycle states and the events that drive them

use crate::crypto::{AdaptorSignature, CryptoError, VerificationError};
use crate::data_structures::{
    AdaptorPoint, Commitment, Destination, Direction, OutputRef, Party, Secret, SwapId, TxRef,
};
use crate::ledger::instruction::LedgerInstruction;
use crate::storage::StoreError;
use crate::swap::evidence::{FraudProof, LockEvidence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SWAP_ID_DOMAIN: &[u8] = b"swap-coordinator/swap-id/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapState {
    Created,
    CollateralLocked,
    TargetLockObserved,
    TargetLockConfirmed,
    Revealed,
    Redeemed,
    Refunded,
    Forfeited,
    Closed,
}

impl SwapState {
    pub const ALL: [SwapState; 9] = [
        SwapState::Created,
        SwapState::CollateralLocked,
        SwapState::TargetLockObserved,
        SwapState::TargetLockConfirmed,
        SwapState::Revealed,
        SwapState::Redeemed,
        SwapState::Refunded,
        SwapState::Forfeited,
        SwapState::Closed,
    ];

    /// Legal next states. Transitions only move forward.
    pub fn successors(&self) -> &'static [SwapState] {
        use SwapState::*;
        match self {
            Created => &[CollateralLocked, Refunded],
            CollateralLocked => &[TargetLockObserved, Refunded],
            TargetLockObserved => &[TargetLockConfirmed, Refunded],
            TargetLockConfirmed => &[Revealed, Refunded, Forfeited],
            Revealed => &[Redeemed, Forfeited],
            Redeemed | Refunded | Forfeited => &[Closed],
            Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: SwapState) -> bool {
        self.successors().contains(&next)
    }

    /// Redeemed, Refunded and Forfeited. Closed is past terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapState::Redeemed | SwapState::Refunded | SwapState::Forfeited)
    }

    // states where the lock timeout still applies
    pub fn awaiting_confirmation(&self) -> bool {
        matches!(
            self,
            SwapState::Created | SwapState::CollateralLocked | SwapState::TargetLockObserved
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != SwapState::Closed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseLeg {
    Unlocked,
    Locked,
    Released,
    Refunded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateralLeg {
    Unlocked,
    Locked,
    Returned,
    Forfeited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    Lock,
    Reveal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapEvent {
    // counterparty posted collateral on the base ledger
    CollateralLocked { amount: u64, tx_ref: TxRef },
    LockObserved(LockEvidence),
    RevealSubmitted(AdaptorSignature),
    FraudReported(FraudProof),
    Timeout(TimeoutKind),
    RefundRequested,
    // executor acknowledged outbox entry `seq`
    InstructionSettled { seq: u64, tx_ref: TxRef },
    Close,
}

impl SwapEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SwapEvent::CollateralLocked { .. } => "collateral_locked",
            SwapEvent::LockObserved(_) => "lock_observed",
            SwapEvent::RevealSubmitted(_) => "reveal_submitted",
            SwapEvent::FraudReported(_) => "fraud_reported",
            SwapEvent::Timeout(TimeoutKind::Lock) => "lock_timeout",
            SwapEvent::Timeout(TimeoutKind::Reveal) => "reveal_timeout",
            SwapEvent::RefundRequested => "refund_requested",
            SwapEvent::InstructionSettled { .. } => "instruction_settled",
            SwapEvent::Close => "close",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInstruction {
    pub seq: u64,
    pub instruction: LedgerInstruction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SwapState,
    pub to: SwapState,
    pub at: DateTime<Utc>,
    pub cause: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub seq: u64,
    pub kind: String,
    pub tx_ref: TxRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSwapParams {
    pub direction: Direction,
    pub owner: Party,
    pub counterparty: Party,
    pub secret_commitment: Commitment,
    pub adaptor_point: AdaptorPoint,
    pub base_amount: u64,
    pub target_amount: u64,
    pub relayer_fee: u64,
    pub relayer: Option<String>, // base account paid `relayer_fee` on redeem
    pub lock_timeout: DateTime<Utc>,
    pub reveal_timeout: DateTime<Utc>,
    pub nonce: u64, // caller-chosen; distinguishes otherwise identical requests
}

impl CreateSwapParams {
    /// blake3 fingerprint of everything that defines the trade.
    pub fn derive_id(&self) -> SwapId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(SWAP_ID_DOMAIN);
        hasher.update(&[match self.direction {
            Direction::BaseToTarget => 0u8,
            Direction::TargetToBase => 1u8,
        }]);
        for party in [&self.owner, &self.counterparty] {
            hasher.update(&(party.base_account.len() as u64).to_le_bytes());
            hasher.update(party.base_account.as_bytes());
            hasher.update(&party.target_key);
        }
        hasher.update(&self.secret_commitment.0);
        hasher.update(&self.adaptor_point.0);
        hasher.update(&self.base_amount.to_le_bytes());
        hasher.update(&self.target_amount.to_le_bytes());
        hasher.update(&self.relayer_fee.to_le_bytes());
        let relayer = self.relayer.as_deref().unwrap_or("");
        hasher.update(&(relayer.len() as u64).to_le_bytes());
        hasher.update(relayer.as_bytes());
        hasher.update(&self.nonce.to_le_bytes());
        SwapId(*hasher.finalize().as_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    pub direction: Direction,
    pub owner: Party,        // funds the base leg
    pub counterparty: Party, // funds the target leg, posts collateral, redeems

    pub secret_commitment: Commitment,
    pub adaptor_point: AdaptorPoint,
    pub base_amount: u64,
    pub target_amount: u64,
    pub collateral_amount: u64, // 0 until locked
    pub relayer_fee: u64,
    pub relayer: Option<String>,
    pub lock_timeout: DateTime<Utc>,
    pub reveal_timeout: DateTime<Utc>,
    pub target_destination: Destination,

    pub state: SwapState,
    pub base_leg: BaseLeg,
    pub collateral: CollateralLeg,
    pub collateral_tx: Option<TxRef>,
    pub target_lock_tx: Option<TxRef>,      // executor receipt for the target lock
    pub target_lock_ref: Option<OutputRef>, // write-once
    pub confirmation_count: u64,
    pub reorg_flagged: bool,
    pub secret_revealed: Option<Secret>, // write-once

    pub outbox: Vec<PendingInstruction>,
    pub withdrawn: Vec<PendingInstruction>, // pulled from the outbox unacknowledged
    pub next_seq: u64,
    pub receipts: Vec<Receipt>,
    pub history: Vec<TransitionRecord>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Swap {
    pub fn new(id: SwapId, params: CreateSwapParams, destination: Destination, now: DateTime<Utc>) -> Self {
        Swap {
            id,
            direction: params.direction,
            owner: params.owner,
            counterparty: params.counterparty,
            secret_commitment: params.secret_commitment,
            adaptor_point: params.adaptor_point,
            base_amount: params.base_amount,
            target_amount: params.target_amount,
            collateral_amount: 0,
            relayer_fee: params.relayer_fee,
            relayer: params.relayer,
            lock_timeout: params.lock_timeout,
            reveal_timeout: params.reveal_timeout,
            target_destination: destination,
            state: SwapState::Created,
            base_leg: BaseLeg::Unlocked,
            collateral: CollateralLeg::Unlocked,
            collateral_tx: None,
            target_lock_tx: None,
            target_lock_ref: None,
            confirmation_count: 0,
            reorg_flagged: false,
            secret_revealed: None,
            outbox: Vec::new(),
            withdrawn: Vec::new(),
            next_seq: 0,
            receipts: Vec::new(),
            history: Vec::new(),
            version: 0,
            created_at: now,
        }
    }

    /// Nothing left to move on either ledger.
    pub fn is_settled(&self) -> bool {
        self.outbox.is_empty()
            && self.base_leg != BaseLeg::Locked
            && self.collateral != CollateralLeg::Locked
    }

    pub fn has_pending(&self, pred: impl Fn(&LedgerInstruction) -> bool) -> bool {
        self.outbox.iter().any(|p| pred(&p.instruction))
    }
}

// Outcome of one accepted event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub swap_id: SwapId,
    pub previous: SwapState,
    pub state: SwapState,
    pub changed: bool,
    pub issued: Vec<PendingInstruction>,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("swap {0} not found")]
    NotFound(SwapId),
    #[error("swap id {0} already exists")]
    IdCollision(SwapId),
    #[error("invalid swap parameters: {0}")]
    InvalidParams(String),
    #[error("collateral must equal the target amount: expected {expected}, got {actual}")]
    CollateralMismatch { expected: u64, actual: u64 },
    #[error("collateral already locked by {0}")]
    CollateralAlreadyLocked(TxRef),
    #[error("evidence rejected: {0}")]
    EvidenceMismatch(String),
    #[error("target lock {offered} conflicts with recorded lock {recorded}")]
    DuplicateLock { recorded: OutputRef, offered: OutputRef },
    #[error("{action} not allowed in state {state:?}")]
    InvalidState { state: SwapState, action: &'static str },
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition { from: SwapState, to: SwapState },
    #[error("reveal window closed at {0}")]
    RevealWindowClosed(DateTime<Utc>),
    #[error("target lock was reorganized away, only a refund remains")]
    TargetLockReorganized,
    #[error("base leg is not locked")]
    BaseLegNotLocked,
    #[error("adaptor signature rejected: {0}")]
    Verification(VerificationError),
    #[error("revealed secret does not open the swap commitment")]
    CommitmentMismatch,
    #[error("fraud proof rejected: {0}")]
    FraudProofRejected(String),
    #[error("refund not available before {0}")]
    NotYetExpired(DateTime<Utc>),
    #[error("swap {0} is closed")]
    Closed(SwapId),
    #[error("swap still has unsettled legs in state {0:?}")]
    Unsettled(SwapState),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker for swap {0} stopped")]
    WorkerStopped(SwapId),
}

impl From<VerificationError> for SwapError {
    fn from(e: VerificationError) -> Self {
        match e {
            VerificationError::CommitmentMismatch => SwapError::CommitmentMismatch,
            other => SwapError::Verification(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_sets_match_lifecycle() {
        assert!(SwapState::Created.can_transition_to(SwapState::CollateralLocked));
        assert!(SwapState::Created.can_transition_to(SwapState::Refunded));
        assert!(!SwapState::Created.can_transition_to(SwapState::Revealed));
        assert!(SwapState::TargetLockConfirmed.can_transition_to(SwapState::Forfeited));
        assert!(!SwapState::TargetLockObserved.can_transition_to(SwapState::Forfeited));
        assert!(!SwapState::Revealed.can_transition_to(SwapState::Refunded));
        assert!(SwapState::Closed.successors().is_empty());
    }

    #[test]
    fn transitions_never_cycle() {
        // every successor sits later in ALL, so no path returns to a state
        for (i, state) in SwapState::ALL.iter().enumerate() {
            for next in state.successors() {
                let j = SwapState::ALL.iter().position(|s| s == next).unwrap();
                assert!(j > i, "{:?} -> {:?} goes backwards", state, next);
            }
        }
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = SwapState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&SwapState::Redeemed, &SwapState::Refunded, &SwapState::Forfeited]);
        assert!(!SwapState::Closed.is_active());
        assert!(SwapState::Revealed.is_active());
    }

    #[test]
    fn commitment_mismatch_maps_to_its_own_variant() {
        assert!(matches!(SwapError::from(VerificationError::CommitmentMismatch), SwapError::CommitmentMismatch));
        assert!(matches!(
            SwapError::from(VerificationError::DiscreteLogMismatch),
            SwapError::Verification(VerificationError::DiscreteLogMismatch)
        ));
    }
}
