use crate::crypto::AdaptorSignature;
use crate::data_structures::{Destination, LedgerId, Secret, SwapId, TxRef};
use crate::ledger::instruction::Payout;
use crate::swap::evidence::FraudProof;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger rejected the transaction: {0}")]
    Rejected(String),
    #[error("malformed instruction: {0}")]
    InvalidInstruction(String),
    #[error("instruction signature does not verify")]
    BadSignature,
    #[error("instruction for {instruction} ledger sent to {executor} executor")]
    WrongLedger { instruction: LedgerId, executor: LedgerId },
    #[error("instruction #{0} was withdrawn before submission")]
    Withdrawn(u64),
}

impl LedgerError {
    /// Transient failures are retried; anything else is reported.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Trait defining the transactions the coordinator submits to one ledger.
/// Implementations must be idempotent per (operation, swap): resubmitting
/// an already-applied instruction returns the original `TxRef`.
#[async_trait]
pub trait LedgerExecutor: Send + Sync {
    fn ledger(&self) -> LedgerId;

    /// Locks `amount` for the swap. Target-ledger locks pay to `destination`.
    async fn submit_lock(
        &self,
        swap_id: &SwapId,
        amount: u64,
        destination: Option<&Destination>,
    ) -> Result<TxRef, LedgerError>;

    /// Pays out the base funds as `payout` splits them and discloses the
    /// secret in the same transaction. Collateral is not touched.
    async fn submit_reveal(
        &self,
        swap_id: &SwapId,
        secret: &Secret,
        signature: &AdaptorSignature,
        payout: &Payout,
    ) -> Result<TxRef, LedgerError>;

    /// Returns the counterparty's collateral after a settled reveal.
    async fn submit_collateral_return(&self, swap_id: &SwapId) -> Result<TxRef, LedgerError>;

    /// Returns whatever this ledger still holds for the swap to its owners.
    async fn submit_refund(&self, swap_id: &SwapId) -> Result<TxRef, LedgerError>;

    /// Moves the counterparty's collateral to the victim of a proven reorg.
    async fn submit_forfeit(&self, swap_id: &SwapId, proof: &FraudProof) -> Result<TxRef, LedgerError>;
}

// One executor per ledger
#[derive(Clone)]
pub struct Executors {
    pub base: Arc<dyn LedgerExecutor>,
    pub target: Arc<dyn LedgerExecutor>,
}

impl Executors {
    pub fn new(base: Arc<dyn LedgerExecutor>, target: Arc<dyn LedgerExecutor>) -> Self {
        Executors { base, target }
    }

    pub fn for_ledger(&self, ledger: LedgerId) -> &Arc<dyn LedgerExecutor> {
        match ledger {
            LedgerId::Base => &self.base,
            LedgerId::Target => &self.target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailability_is_transient() {
        assert!(LedgerError::Unavailable("timeout".into()).is_transient());
        assert!(!LedgerError::Rejected("nonce too low".into()).is_transient());
        assert!(!LedgerError::BadSignature.is_transient());
        assert!(!LedgerError::Withdrawn(3).is_transient());
        assert!(!LedgerError::WrongLedger { instruction: LedgerId::Base, executor: LedgerId::Target }.is_transient());
    }
}
