// In-process ledgers for tests and local runs.
//
// MockExecutor records every submission and answers repeats with the
// original TxRef. SimulatedTargetChain models a confirmation-depth ledger:
// outputs are mined into blocks, can be reorganized away, and the whole
// chain can be made unreachable.

use crate::crypto::AdaptorSignature;
use crate::data_structures::{Destination, LedgerId, OutputRef, Secret, SwapId, TxRef};
use crate::ledger::instruction::Payout;
use crate::ledger::interface::{LedgerError, LedgerExecutor};
use crate::ledger::observer::BlockSource;
use crate::swap::evidence::{FraudProof, LockEvidence, ReplacementOutput};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmissionKind {
    Lock,
    Reveal,
    CollateralReturn,
    Refund,
    Forfeit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub kind: SubmissionKind,
    pub swap_id: SwapId,
    pub tx_ref: TxRef,
    pub amount: Option<u64>,
    pub secret: Option<Secret>,
    pub payout: Option<Payout>,
}

#[derive(Debug, Default)]
struct MockLedgerState {
    applied: HashMap<(SubmissionKind, SwapId), TxRef>,
    log: Vec<Submission>,
    attempts: u64,
    fail_next: u32,
    next_tx: u64,
}

fn lock_state<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct MockExecutor {
    ledger: LedgerId,
    state: Mutex<MockLedgerState>,
}

impl MockExecutor {
    pub fn new(ledger: LedgerId) -> Self {
        MockExecutor { ledger, state: Mutex::new(MockLedgerState::default()) }
    }

    /// Makes the next `n` submissions fail with `LedgerError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        lock_state(&self.state).fail_next = n;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock_state(&self.state).log.clone()
    }

    pub fn count(&self, kind: SubmissionKind, swap_id: &SwapId) -> usize {
        lock_state(&self.state)
            .log
            .iter()
            .filter(|s| s.kind == kind && s.swap_id == *swap_id)
            .count()
    }

    /// Payout of the applied reveal for `swap_id`, if any.
    pub fn payout(&self, swap_id: &SwapId) -> Option<Payout> {
        lock_state(&self.state)
            .log
            .iter()
            .find(|s| s.kind == SubmissionKind::Reveal && s.swap_id == *swap_id)
            .and_then(|s| s.payout.clone())
    }

    /// Total calls, including failed and repeated ones.
    pub fn attempts(&self) -> u64 {
        lock_state(&self.state).attempts
    }

    fn apply(&self, record: Submission) -> Result<TxRef, LedgerError> {
        let (kind, swap_id) = (record.kind, record.swap_id);
        let mut state = lock_state(&self.state);
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LedgerError::Unavailable(format!("{} ledger unreachable", self.ledger)));
        }
        if let Some(existing) = state.applied.get(&(kind, swap_id)) {
            debug!("MockExecutor {}: repeat {:?} for swap {}, returning {}", self.ledger, kind, swap_id, existing);
            return Ok(existing.clone());
        }
        state.next_tx += 1;
        let tx_ref = TxRef(format!("{}-tx-{}", self.ledger, state.next_tx));
        info!("MockExecutor {}: applied {:?} for swap {} as {}", self.ledger, kind, swap_id, tx_ref);
        state.applied.insert((kind, swap_id), tx_ref.clone());
        state.log.push(Submission { tx_ref: tx_ref.clone(), ..record });
        Ok(tx_ref)
    }
}

fn submission(kind: SubmissionKind, swap_id: &SwapId) -> Submission {
    Submission { kind, swap_id: *swap_id, tx_ref: TxRef(String::new()), amount: None, secret: None, payout: None }
}

#[async_trait]
impl LedgerExecutor for MockExecutor {
    fn ledger(&self) -> LedgerId {
        self.ledger
    }

    async fn submit_lock(
        &self,
        swap_id: &SwapId,
        amount: u64,
        _destination: Option<&Destination>,
    ) -> Result<TxRef, LedgerError> {
        let record = Submission { amount: Some(amount), ..submission(SubmissionKind::Lock, swap_id) };
        self.apply(record)
    }

    async fn submit_reveal(
        &self,
        swap_id: &SwapId,
        secret: &Secret,
        _signature: &AdaptorSignature,
        payout: &Payout,
    ) -> Result<TxRef, LedgerError> {
        let record = Submission {
            amount: Some(payout.total()),
            secret: Some(*secret),
            payout: Some(payout.clone()),
            ..submission(SubmissionKind::Reveal, swap_id)
        };
        self.apply(record)
    }

    async fn submit_collateral_return(&self, swap_id: &SwapId) -> Result<TxRef, LedgerError> {
        self.apply(submission(SubmissionKind::CollateralReturn, swap_id))
    }

    async fn submit_refund(&self, swap_id: &SwapId) -> Result<TxRef, LedgerError> {
        self.apply(submission(SubmissionKind::Refund, swap_id))
    }

    async fn submit_forfeit(&self, swap_id: &SwapId, _proof: &FraudProof) -> Result<TxRef, LedgerError> {
        self.apply(submission(SubmissionKind::Forfeit, swap_id))
    }
}

// An output paying to a swap's one-time destination
#[derive(Clone, Debug)]
struct SimOutput {
    swap_id: SwapId,
    lock_ref: OutputRef,
    destination: Destination,
    amount: u64,
    included_at: Option<u64>, // None while in the mempool
}

#[derive(Debug, Default)]
struct TargetChainState {
    height: u64,
    outputs: Vec<SimOutput>,
    reorgs: Vec<FraudProof>,
    refunds: HashMap<SwapId, TxRef>,
    unreachable: bool,
    next_tx: u64,
}

#[derive(Debug)]
pub struct SimulatedTargetChain {
    oracle_key: SigningKey,
    state: Mutex<TargetChainState>,
}

impl SimulatedTargetChain {
    pub fn new(oracle_key: SigningKey) -> Self {
        SimulatedTargetChain { oracle_key, state: Mutex::new(TargetChainState::default()) }
    }

    pub fn height(&self) -> u64 {
        lock_state(&self.state).height
    }

    /// Broadcasts an output to `destination`; it is included by the next mined block.
    pub fn lock_output(&self, swap_id: SwapId, destination: Destination, amount: u64) -> OutputRef {
        let mut state = lock_state(&self.state);
        push_output(&mut state, swap_id, destination, amount)
    }

    pub fn mine(&self, blocks: u64) {
        let mut state = lock_state(&self.state);
        for _ in 0..blocks {
            state.height += 1;
            let height = state.height;
            for output in state.outputs.iter_mut().filter(|o| o.included_at.is_none()) {
                output.included_at = Some(height);
            }
        }
        debug!("TargetChain: height {}", state.height);
    }

    pub fn confirmations(&self, lock_ref: &OutputRef) -> u64 {
        let state = lock_state(&self.state);
        state
            .outputs
            .iter()
            .find(|o| o.lock_ref == *lock_ref)
            .map_or(0, |o| confirmations_at(state.height, o))
    }

    /// Reorganizes `depth` blocks away so the lock is replaced by a payment
    /// to `recipient_key`. Returns the oracle-attested proof.
    pub fn reorg_lock(&self, lock_ref: &OutputRef, depth: u64, recipient_key: [u8; 32]) -> Option<FraudProof> {
        let mut state = lock_state(&self.state);
        let pos = state.outputs.iter().position(|o| o.lock_ref == *lock_ref)?;
        let removed = state.outputs.remove(pos);
        let proof = FraudProof::attest(
            removed.swap_id,
            removed.lock_ref.clone(),
            ReplacementOutput {
                tx_ref: TxRef(format!("reorg-{}", removed.lock_ref.tx_id)),
                recipient_key,
                height: state.height,
            },
            depth,
            &self.oracle_key,
        );
        info!("TargetChain: reorg of depth {} displaced {}", depth, removed.lock_ref);
        state.reorgs.push(proof.clone());
        Some(proof)
    }

    pub fn refunded(&self, swap_id: &SwapId) -> bool {
        lock_state(&self.state).refunds.contains_key(swap_id)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock_state(&self.state).unreachable = unreachable;
    }

    fn check_reachable(state: &TargetChainState) -> Result<(), LedgerError> {
        if state.unreachable {
            Err(LedgerError::Unavailable("target node not responding".into()))
        } else {
            Ok(())
        }
    }
}

fn push_output(state: &mut TargetChainState, swap_id: SwapId, destination: Destination, amount: u64) -> OutputRef {
    state.next_tx += 1;
    let lock_ref = OutputRef { tx_id: format!("target-tx-{}", state.next_tx), index: 0 };
    debug!("TargetChain: pending output {} for swap {}", lock_ref, swap_id);
    state.outputs.push(SimOutput { swap_id, lock_ref: lock_ref.clone(), destination, amount, included_at: None });
    lock_ref
}

fn confirmations_at(height: u64, output: &SimOutput) -> u64 {
    output.included_at.map_or(0, |inc| height.saturating_sub(inc) + 1)
}

#[async_trait]
impl BlockSource for SimulatedTargetChain {
    async fn lock_status(
        &self,
        swap_id: &SwapId,
        destination: &Destination,
    ) -> Result<Option<LockEvidence>, LedgerError> {
        let state = lock_state(&self.state);
        Self::check_reachable(&state)?;
        let evidence = state
            .outputs
            .iter()
            .find(|o| o.swap_id == *swap_id && o.destination == *destination && o.included_at.is_some())
            .map(|o| LockEvidence {
                swap_id: *swap_id,
                lock_ref: o.lock_ref.clone(),
                destination: o.destination,
                amount: o.amount,
                confirmations: confirmations_at(state.height, o),
                reorg_depth: 0,
            });
        Ok(evidence)
    }

    async fn reorg_candidates(
        &self,
        swap_id: &SwapId,
        lock_ref: &OutputRef,
        min_depth: u64,
    ) -> Result<Vec<FraudProof>, LedgerError> {
        let state = lock_state(&self.state);
        Self::check_reachable(&state)?;
        Ok(state
            .reorgs
            .iter()
            .filter(|p| p.swap_id == *swap_id && p.original == *lock_ref && p.reorg_depth >= min_depth)
            .cloned()
            .collect())
    }
}

// The chain also acts as the target-ledger executor: locks become outputs,
// refunds are recorded once per swap.
#[async_trait]
impl LedgerExecutor for SimulatedTargetChain {
    fn ledger(&self) -> LedgerId {
        LedgerId::Target
    }

    async fn submit_lock(
        &self,
        swap_id: &SwapId,
        amount: u64,
        destination: Option<&Destination>,
    ) -> Result<TxRef, LedgerError> {
        let destination = destination
            .copied()
            .ok_or_else(|| LedgerError::InvalidInstruction("target lock without destination".into()))?;
        let mut state = lock_state(&self.state);
        Self::check_reachable(&state)?;
        if let Some(existing) = state.outputs.iter().find(|o| o.swap_id == *swap_id) {
            return Ok(TxRef(existing.lock_ref.tx_id.clone()));
        }
        let lock_ref = push_output(&mut state, *swap_id, destination, amount);
        Ok(TxRef(lock_ref.tx_id))
    }

    async fn submit_reveal(
        &self,
        _swap_id: &SwapId,
        _secret: &Secret,
        _signature: &AdaptorSignature,
        _payout: &Payout,
    ) -> Result<TxRef, LedgerError> {
        Err(LedgerError::Rejected("reveal is a base-ledger operation".into()))
    }

    async fn submit_collateral_return(&self, _swap_id: &SwapId) -> Result<TxRef, LedgerError> {
        Err(LedgerError::Rejected("collateral lives on the base ledger".into()))
    }

    async fn submit_refund(&self, swap_id: &SwapId) -> Result<TxRef, LedgerError> {
        let mut state = lock_state(&self.state);
        Self::check_reachable(&state)?;
        if let Some(existing) = state.refunds.get(swap_id) {
            return Ok(existing.clone());
        }
        state.next_tx += 1;
        let tx_ref = TxRef(format!("target-refund-{}", state.next_tx));
        state.refunds.insert(*swap_id, tx_ref.clone());
        Ok(tx_ref)
    }

    async fn submit_forfeit(&self, _swap_id: &SwapId, _proof: &FraudProof) -> Result<TxRef, LedgerError> {
        Err(LedgerError::Rejected("collateral lives on the base ledger".into()))
    }
}
