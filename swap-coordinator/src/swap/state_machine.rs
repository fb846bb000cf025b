// Guarded transitions for a single swap.
//
// `apply` mutates a working copy of the record; the registry persists it
// only when the event is accepted and something changed. Any error leaves
// the stored record untouched.

use crate::config::SwapConfig;
use crate::crypto::adaptor::decompress_point;
use crate::crypto::{AdaptorSignature, CryptoCapability};
use crate::data_structures::{Direction, LedgerId, TxRef};
use crate::ledger::instruction::{LedgerInstruction, Payout};
use crate::swap::evidence::{FraudProof, LockEvidence};
use crate::swap::types::{
    BaseLeg, CollateralLeg, CreateSwapParams, PendingInstruction, Receipt, Swap, SwapError, SwapEvent,
    SwapState, TimeoutKind, TransitionRecord,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::VerifyingKey;
use log::{info, warn};

// Everything a transition may consult besides the record itself
pub struct TransitionContext<'a> {
    pub config: &'a SwapConfig,
    pub crypto: &'a dyn CryptoCapability,
    pub oracle_key: &'a VerifyingKey,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Applied {
    pub changed: bool,
    pub issued: Vec<PendingInstruction>,
}

impl Applied {
    fn unchanged() -> Self {
        Applied::default()
    }
}

/// Creation-time checks on a swap request.
pub fn validate_params(params: &CreateSwapParams, ctx: &TransitionContext<'_>) -> Result<(), SwapError> {
    if params.base_amount == 0 || params.target_amount == 0 {
        return Err(SwapError::InvalidParams("amounts must be positive".into()));
    }
    if params.secret_commitment.is_zero() {
        return Err(SwapError::InvalidParams("secret commitment is zero".into()));
    }
    decompress_point(&params.adaptor_point)
        .map_err(|e| SwapError::InvalidParams(format!("adaptor point: {}", e)))?;
    if params.relayer_fee > params.base_amount / ctx.config.max_relayer_fee_divisor {
        return Err(SwapError::InvalidParams(format!(
            "relayer fee {} exceeds 1/{} of base amount {}",
            params.relayer_fee, ctx.config.max_relayer_fee_divisor, params.base_amount
        )));
    }
    if params.relayer_fee > 0 && params.relayer.as_deref().map_or(true, str::is_empty) {
        return Err(SwapError::InvalidParams("relayer fee set without a relayer account".into()));
    }
    let window = ChronoDuration::from_std(ctx.config.min_lock_window)
        .map_err(|_| SwapError::InvalidParams("min_lock_window out of range".into()))?;
    if params.lock_timeout < ctx.now + window {
        return Err(SwapError::InvalidParams(format!(
            "lock timeout {} is earlier than now + {:?}",
            params.lock_timeout, ctx.config.min_lock_window
        )));
    }
    if params.reveal_timeout <= params.lock_timeout {
        return Err(SwapError::InvalidParams("reveal timeout must be after lock timeout".into()));
    }
    if params.owner.target_key == params.counterparty.target_key {
        return Err(SwapError::InvalidParams("owner and counterparty share a target key".into()));
    }
    Ok(())
}

/// Instructions a freshly created swap starts with.
pub fn open(swap: &mut Swap) -> Vec<PendingInstruction> {
    match swap.direction {
        Direction::BaseToTarget => {
            let lock = base_lock(swap);
            vec![issue(swap, lock)]
        }
        Direction::TargetToBase => Vec::new(),
    }
}

pub fn apply(swap: &mut Swap, event: &SwapEvent, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    if swap.state == SwapState::Closed {
        return Err(SwapError::Closed(swap.id));
    }
    let applied = match event {
        SwapEvent::InstructionSettled { seq, tx_ref } => settle(swap, *seq, tx_ref, ctx)?,
        SwapEvent::Close => close(swap, ctx)?,
        SwapEvent::RefundRequested => refund_requested(swap, ctx)?,
        SwapEvent::Timeout(TimeoutKind::Lock) if swap.state == SwapState::Forfeited => {
            match refund_after_forfeit(swap, ctx) {
                Err(SwapError::NotYetExpired(_)) => Applied::unchanged(),
                other => other?,
            }
        }
        _ if swap.state.is_terminal() => {
            info!("Swap [{}]: {} ignored in terminal state {:?}", swap.id, event.name(), swap.state);
            Applied::unchanged()
        }
        SwapEvent::CollateralLocked { amount, tx_ref } => collateral_locked(swap, *amount, tx_ref, ctx)?,
        SwapEvent::LockObserved(evidence) => lock_observed(swap, evidence, ctx)?,
        SwapEvent::RevealSubmitted(sig) => reveal(swap, sig, ctx)?,
        SwapEvent::FraudReported(proof) => fraud_reported(swap, proof, ctx)?,
        SwapEvent::Timeout(kind) => timeout(swap, *kind, ctx)?,
    };
    if applied.changed && swap.state.is_terminal() && swap.outbox.is_empty() && !swap.is_settled() {
        // nothing in flight but a leg still locked; only a refund request can move it
        warn!("Swap [{}]: {:?} with unsettled legs and an empty outbox", swap.id, swap.state);
    }
    Ok(applied)
}

fn advance(swap: &mut Swap, to: SwapState, cause: &str, now: DateTime<Utc>) -> Result<(), SwapError> {
    let from = swap.state;
    if !from.can_transition_to(to) {
        return Err(SwapError::IllegalTransition { from, to });
    }
    info!("Swap [{}]: {:?} -> {:?} ({})", swap.id, from, to, cause);
    swap.history.push(TransitionRecord { from, to, at: now, cause: cause.to_string() });
    swap.state = to;
    Ok(())
}

fn issue(swap: &mut Swap, instruction: LedgerInstruction) -> PendingInstruction {
    let pending = PendingInstruction { seq: swap.next_seq, instruction };
    swap.next_seq += 1;
    swap.outbox.push(pending.clone());
    pending
}

fn base_lock(swap: &Swap) -> LedgerInstruction {
    LedgerInstruction::Lock {
        ledger: LedgerId::Base,
        swap_id: swap.id,
        amount: swap.base_amount,
        destination: None,
    }
}

fn collateral_locked(
    swap: &mut Swap,
    amount: u64,
    tx_ref: &TxRef,
    ctx: &TransitionContext<'_>,
) -> Result<Applied, SwapError> {
    if let Some(existing) = &swap.collateral_tx {
        if existing == tx_ref {
            return Ok(Applied::unchanged());
        }
        return Err(SwapError::CollateralAlreadyLocked(existing.clone()));
    }
    if swap.state != SwapState::Created {
        return Err(SwapError::InvalidState { state: swap.state, action: "collateral lock" });
    }
    if amount != swap.target_amount {
        return Err(SwapError::CollateralMismatch { expected: swap.target_amount, actual: amount });
    }
    if ctx.now >= swap.lock_timeout {
        return Err(SwapError::InvalidState { state: swap.state, action: "collateral lock after lock timeout" });
    }

    swap.collateral_amount = amount;
    swap.collateral = CollateralLeg::Locked;
    swap.collateral_tx = Some(tx_ref.clone());
    advance(swap, SwapState::CollateralLocked, "collateral locked", ctx.now)?;

    let target_lock = LedgerInstruction::Lock {
        ledger: LedgerId::Target,
        swap_id: swap.id,
        amount: swap.target_amount,
        destination: Some(swap.target_destination),
    };
    let issued = vec![issue(swap, target_lock)];
    Ok(Applied { changed: true, issued })
}

fn lock_observed(
    swap: &mut Swap,
    evidence: &LockEvidence,
    ctx: &TransitionContext<'_>,
) -> Result<Applied, SwapError> {
    if evidence.swap_id != swap.id {
        return Err(SwapError::EvidenceMismatch(format!("evidence is for swap {}", evidence.swap_id)));
    }
    if evidence.destination != swap.target_destination {
        return Err(SwapError::EvidenceMismatch("destination does not match the derived one-time destination".into()));
    }
    if evidence.amount < swap.target_amount {
        return Err(SwapError::EvidenceMismatch(format!(
            "locked {} but the swap needs {}",
            evidence.amount, swap.target_amount
        )));
    }
    if let Some(recorded) = &swap.target_lock_ref {
        if *recorded != evidence.lock_ref {
            return Err(SwapError::DuplicateLock { recorded: recorded.clone(), offered: evidence.lock_ref.clone() });
        }
    }

    match swap.state {
        SwapState::CollateralLocked | SwapState::TargetLockObserved => {}
        SwapState::Created => {
            return Err(SwapError::InvalidState { state: swap.state, action: "target lock before collateral" })
        }
        // already past confirmation, same lock: nothing to do
        _ => return Ok(Applied::unchanged()),
    }

    let mut changed = false;
    if evidence.reorg_depth > 0 && !swap.reorg_flagged {
        warn!(
            "Swap [{}]: lock {} reports a reorg of depth {}, blocking confirmation",
            swap.id, evidence.lock_ref, evidence.reorg_depth
        );
        swap.reorg_flagged = true;
        changed = true;
    }
    if swap.target_lock_ref.is_none() {
        swap.target_lock_ref = Some(evidence.lock_ref.clone());
        changed = true;
    }
    if evidence.confirmations > swap.confirmation_count {
        swap.confirmation_count = evidence.confirmations;
        changed = true;
    }
    if swap.state == SwapState::CollateralLocked {
        advance(swap, SwapState::TargetLockObserved, "target lock observed", ctx.now)?;
        changed = true;
    }

    let mut issued = Vec::new();
    if swap.confirmation_count >= ctx.config.confirmation_threshold {
        if swap.reorg_flagged {
            warn!("Swap [{}]: {} confirmations but a reorg is pending, holding", swap.id, swap.confirmation_count);
        } else {
            advance(swap, SwapState::TargetLockConfirmed, "target lock confirmed", ctx.now)?;
            changed = true;
            if swap.direction == Direction::TargetToBase && swap.base_leg == BaseLeg::Unlocked {
                let lock = base_lock(swap);
                issued.push(issue(swap, lock));
            }
        }
    }
    Ok(Applied { changed, issued })
}

fn reveal(swap: &mut Swap, sig: &AdaptorSignature, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    match swap.state {
        SwapState::TargetLockConfirmed => {}
        SwapState::Revealed => return Ok(Applied::unchanged()),
        state => return Err(SwapError::InvalidState { state, action: "reveal" }),
    }
    if ctx.now > swap.reveal_timeout {
        return Err(SwapError::RevealWindowClosed(swap.reveal_timeout));
    }
    if swap.reorg_flagged {
        return Err(SwapError::TargetLockReorganized);
    }
    if swap.base_leg != BaseLeg::Locked {
        return Err(SwapError::BaseLegNotLocked);
    }
    if swap.collateral != CollateralLeg::Locked || swap.collateral_amount != swap.target_amount {
        return Err(SwapError::CollateralMismatch { expected: swap.target_amount, actual: swap.collateral_amount });
    }

    let secret = ctx
        .crypto
        .verify_adaptor_signature(sig, &swap.adaptor_point, &swap.secret_commitment)
        .map_err(|e| {
            warn!("Swap [{}]: reveal rejected: {}", swap.id, e);
            SwapError::from(e)
        })?;
    if ctx.crypto.commit(&secret) != swap.secret_commitment {
        return Err(SwapError::CommitmentMismatch);
    }

    swap.secret_revealed = Some(secret);
    advance(swap, SwapState::Revealed, "adaptor signature verified", ctx.now)?;
    let payout = Payout {
        redeemer: swap.counterparty.base_account.clone(),
        amount: swap.base_amount.saturating_sub(swap.relayer_fee),
        relayer: swap.relayer.clone(),
        relayer_fee: swap.relayer_fee,
    };
    let instruction = LedgerInstruction::Reveal { swap_id: swap.id, secret, signature: *sig, payout };
    let issued = vec![issue(swap, instruction)];
    Ok(Applied { changed: true, issued })
}

fn fraud_reported(swap: &mut Swap, proof: &FraudProof, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    if proof.swap_id != swap.id {
        return Err(SwapError::FraudProofRejected(format!("proof is for swap {}", proof.swap_id)));
    }
    if !proof.verify(ctx.oracle_key) {
        return Err(SwapError::FraudProofRejected("oracle attestation does not verify".into()));
    }
    if swap.target_lock_ref.as_ref() != Some(&proof.original) {
        return Err(SwapError::FraudProofRejected("proof does not reference the recorded target lock".into()));
    }

    let attributable = proof.is_attributable_to(&swap.counterparty.target_key)
        && proof.reorg_depth >= ctx.config.fraud_reorg_depth;

    match swap.state {
        SwapState::TargetLockConfirmed | SwapState::Revealed if attributable => {
            advance(swap, SwapState::Forfeited, "lock owner reorganized the target lock", ctx.now)?;
            withdraw_reveal(swap);
            let forfeit = LedgerInstruction::Forfeit { swap_id: swap.id, proof: proof.clone() };
            let issued = vec![issue(swap, forfeit)];
            Ok(Applied { changed: true, issued })
        }
        SwapState::CollateralLocked | SwapState::TargetLockObserved => {
            if swap.reorg_flagged {
                return Ok(Applied::unchanged());
            }
            warn!("Swap [{}]: reorg of depth {} before confirmation, blocking confirmation", swap.id, proof.reorg_depth);
            swap.reorg_flagged = true;
            Ok(Applied { changed: true, issued: Vec::new() })
        }
        SwapState::TargetLockConfirmed if proof.reorg_depth >= ctx.config.fraud_reorg_depth => {
            if swap.reorg_flagged {
                return Ok(Applied::unchanged());
            }
            warn!(
                "Swap [{}]: target lock lost to a reorg of depth {} not attributable to the lock owner, refund only",
                swap.id, proof.reorg_depth
            );
            swap.reorg_flagged = true;
            Ok(Applied { changed: true, issued: Vec::new() })
        }
        _ => {
            info!(
                "Swap [{}]: reorg of depth {} not attributable to the lock owner, no forfeiture",
                swap.id, proof.reorg_depth
            );
            Ok(Applied::unchanged())
        }
    }
}

// An unacknowledged reveal must not pay out once the collateral is forfeited.
// It may already be in flight; a late acknowledgement is still recorded.
fn withdraw_reveal(swap: &mut Swap) {
    let (reveals, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut swap.outbox)
        .into_iter()
        .partition(|p| matches!(p.instruction, LedgerInstruction::Reveal { .. }));
    swap.outbox = rest;
    for pending in reveals {
        warn!("Swap [{}]: withdrawing unacknowledged reveal #{}", swap.id, pending.seq);
        swap.withdrawn.push(pending);
    }
}

fn timeout(swap: &mut Swap, kind: TimeoutKind, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    let due = match kind {
        TimeoutKind::Lock => swap.state.awaiting_confirmation() && ctx.now >= swap.lock_timeout,
        TimeoutKind::Reveal => swap.state == SwapState::TargetLockConfirmed && ctx.now >= swap.reveal_timeout,
    };
    if !due {
        return Ok(Applied::unchanged());
    }
    let cause = match kind {
        TimeoutKind::Lock => "lock timeout",
        TimeoutKind::Reveal => "reveal timeout",
    };
    refund(swap, cause, ctx.now)
}

fn refund_requested(swap: &mut Swap, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    match swap.state {
        s if s.awaiting_confirmation() => {
            if ctx.now < swap.lock_timeout {
                return Err(SwapError::NotYetExpired(swap.lock_timeout));
            }
            refund(swap, "refund requested after lock timeout", ctx.now)
        }
        SwapState::TargetLockConfirmed => {
            if ctx.now < swap.reveal_timeout {
                return Err(SwapError::NotYetExpired(swap.reveal_timeout));
            }
            refund(swap, "refund requested after reveal timeout", ctx.now)
        }
        SwapState::Forfeited => refund_after_forfeit(swap, ctx),
        SwapState::Redeemed | SwapState::Refunded => Ok(Applied::unchanged()),
        state => Err(SwapError::InvalidState { state, action: "refund" }),
    }
}

// Collateral is gone but the owner's base leg is refundable on its own schedule
fn refund_after_forfeit(swap: &mut Swap, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    if swap.base_leg != BaseLeg::Locked
        || swap.has_pending(|i| matches!(i, LedgerInstruction::Refund { ledger: LedgerId::Base, .. }))
    {
        return Ok(Applied::unchanged());
    }
    if ctx.now < swap.lock_timeout {
        return Err(SwapError::NotYetExpired(swap.lock_timeout));
    }
    info!("Swap [{}]: refunding base leg after forfeiture", swap.id);
    let refund = LedgerInstruction::Refund { ledger: LedgerId::Base, swap_id: swap.id };
    let issued = vec![issue(swap, refund)];
    Ok(Applied { changed: true, issued })
}

fn refund(swap: &mut Swap, cause: &str, now: DateTime<Utc>) -> Result<Applied, SwapError> {
    advance(swap, SwapState::Refunded, cause, now)?;
    let mut issued = Vec::new();

    let base_pending = swap.has_pending(|i| matches!(i, LedgerInstruction::Lock { ledger: LedgerId::Base, .. }));
    if swap.base_leg == BaseLeg::Locked || swap.collateral == CollateralLeg::Locked || base_pending {
        let refund = LedgerInstruction::Refund { ledger: LedgerId::Base, swap_id: swap.id };
        issued.push(issue(swap, refund));
    }
    let target_pending = swap.has_pending(|i| matches!(i, LedgerInstruction::Lock { ledger: LedgerId::Target, .. }));
    if swap.target_lock_ref.is_some() || swap.target_lock_tx.is_some() || target_pending {
        let refund = LedgerInstruction::Refund { ledger: LedgerId::Target, swap_id: swap.id };
        issued.push(issue(swap, refund));
    }
    Ok(Applied { changed: true, issued })
}

fn settle(swap: &mut Swap, seq: u64, tx_ref: &TxRef, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    let pending = if let Some(pos) = swap.outbox.iter().position(|p| p.seq == seq) {
        swap.outbox.remove(pos)
    } else if let Some(pos) = swap.withdrawn.iter().position(|p| p.seq == seq) {
        warn!("Swap [{}]: withdrawn #{} was applied by the ledger anyway", swap.id, seq);
        swap.withdrawn.remove(pos)
    } else {
        // already settled
        return Ok(Applied::unchanged());
    };
    swap.receipts.push(Receipt { seq, kind: pending.instruction.kind().to_string(), tx_ref: tx_ref.clone() });

    let mut issued = Vec::new();
    match &pending.instruction {
        LedgerInstruction::Lock { ledger: LedgerId::Base, .. } => {
            if swap.base_leg == BaseLeg::Unlocked {
                swap.base_leg = BaseLeg::Locked;
            }
        }
        LedgerInstruction::Lock { ledger: LedgerId::Target, .. } => {
            swap.target_lock_tx = Some(tx_ref.clone());
        }
        LedgerInstruction::Reveal { .. } => {
            if swap.base_leg == BaseLeg::Locked {
                swap.base_leg = BaseLeg::Released;
            }
            if swap.state == SwapState::Revealed {
                advance(swap, SwapState::Redeemed, "reveal settled on base ledger", ctx.now)?;
                if swap.collateral == CollateralLeg::Locked {
                    let release = LedgerInstruction::ReturnCollateral { swap_id: swap.id };
                    issued.push(issue(swap, release));
                }
            }
        }
        LedgerInstruction::ReturnCollateral { .. } => {
            if swap.collateral == CollateralLeg::Locked {
                swap.collateral = CollateralLeg::Returned;
            }
        }
        LedgerInstruction::Refund { ledger: LedgerId::Base, .. } => {
            if swap.base_leg == BaseLeg::Locked {
                swap.base_leg = BaseLeg::Refunded;
            }
            if swap.collateral == CollateralLeg::Locked {
                swap.collateral = CollateralLeg::Returned;
            }
        }
        LedgerInstruction::Refund { ledger: LedgerId::Target, .. } => {}
        LedgerInstruction::Forfeit { .. } => {
            swap.collateral = CollateralLeg::Forfeited;
        }
    }
    Ok(Applied { changed: true, issued })
}

fn close(swap: &mut Swap, ctx: &TransitionContext<'_>) -> Result<Applied, SwapError> {
    if !swap.state.is_terminal() {
        return Err(SwapError::InvalidState { state: swap.state, action: "close" });
    }
    if !swap.is_settled() {
        return Err(SwapError::Unsettled(swap.state));
    }
    advance(swap, SwapState::Closed, "all legs settled", ctx.now)?;
    Ok(Applied { changed: true, issued: Vec::new() })
}
