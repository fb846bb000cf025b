// swap-coordinator/src/swap/coordinator.rs
//
// Request surface and per-swap actors.
//
// Every live swap gets one worker task that consumes its envelope queue in
// arrival order. Ledger I/O never runs inside the worker: a dispatcher task
// submits outbox instructions and observer streams are forwarded by watch
// tasks, all of which re-enter the queue as events. Workers close their
// swap once it is terminal and every leg is settled, then exit.

use crate::config::{ConfigError, SwapConfig};
use crate::crypto::{AdaptorSignature, CryptoCapability};
use crate::data_structures::{SwapId, TxRef};
use crate::ledger::instruction::{dispatch_instruction, LedgerInstruction, SignedInstruction};
use crate::ledger::interface::{Executors, LedgerError};
use crate::ledger::observer::LedgerObserver;
use crate::ledger::retry::{retry_with_backoff, RetryPolicy};
use crate::storage::SwapStore;
use crate::swap::evidence::{FraudProof, LockEvidence};
use crate::swap::registry::SwapRegistry;
use crate::swap::state_machine::TransitionContext;
use crate::swap::types::{
    BaseLeg, CreateSwapParams, PendingInstruction, Swap, SwapError, SwapEvent, SwapState, TimeoutKind, Transition,
};
use crate::timeout::{TimeoutClock, TimerHandle, TimerToken};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

pub struct CoordinatorDeps {
    pub config: SwapConfig,
    pub store: Arc<dyn SwapStore>,
    pub crypto: Arc<dyn CryptoCapability>,
    pub observer: Arc<dyn LedgerObserver>,
    pub executors: Executors,
    pub signing_key: SigningKey, // signs every outgoing instruction
    pub oracle_key: VerifyingKey, // the one trusted fraud-proof attester
}

type Reply = oneshot::Sender<Result<Transition, SwapError>>;

// Outbox seqs the dispatcher must no longer submit
type WithdrawnSeqs = Arc<Mutex<HashSet<u64>>>;

struct Envelope {
    event: SwapEvent,
    reply: Option<Reply>,
}

impl Envelope {
    fn internal(event: SwapEvent) -> Self {
        Envelope { event, reply: None }
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
    task: AbortHandle,
}

struct Inner {
    config: SwapConfig,
    registry: SwapRegistry,
    crypto: Arc<dyn CryptoCapability>,
    observer: Arc<dyn LedgerObserver>,
    executors: Executors,
    signing_key: SigningKey,
    oracle_key: VerifyingKey,
    clock: TimeoutClock,
    workers: Mutex<HashMap<SwapId, WorkerHandle>>,
}

fn lock_workers(m: &Mutex<HashMap<SwapId, WorkerHandle>>) -> MutexGuard<'_, HashMap<SwapId, WorkerHandle>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_withdrawn(withdrawn: &Mutex<HashSet<u64>>, seq: u64) -> bool {
    withdrawn.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(&seq)
}

impl Inner {
    fn ctx(&self) -> TransitionContext<'_> {
        TransitionContext {
            config: &self.config,
            crypto: self.crypto.as_ref(),
            oracle_key: &self.oracle_key,
            now: Utc::now(),
        }
    }

    fn live_worker(&self, id: &SwapId) -> Option<mpsc::Sender<Envelope>> {
        lock_workers(&self.workers).get(id).filter(|h| !h.tx.is_closed()).map(|h| h.tx.clone())
    }

    // Starts a worker unless a live one already exists, in which case
    // `first` is handed back to the caller.
    fn try_spawn_worker(self: &Arc<Self>, id: SwapId, first: Option<Envelope>) -> Option<Envelope> {
        let mut workers = lock_workers(&self.workers);
        if workers.get(&id).map_or(false, |h| !h.tx.is_closed()) {
            return first;
        }
        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let worker = SwapWorker::new(self.clone(), id, tx.clone());
        let task = tokio::spawn(worker.run(rx, first));
        debug!("Coordinator [{}]: worker started", id);
        workers.insert(id, WorkerHandle { tx, task: task.abort_handle() });
        None
    }

    fn forget_worker(&self, id: &SwapId, tx: &mpsc::Sender<Envelope>) {
        let mut workers = lock_workers(&self.workers);
        if workers.get(id).map_or(false, |h| h.tx.same_channel(tx)) {
            workers.remove(id);
        }
    }

    async fn enqueue(self: &Arc<Self>, id: SwapId, envelope: Envelope) {
        let mut envelope = envelope;
        loop {
            if let Some(tx) = self.live_worker(&id) {
                match tx.send(envelope).await {
                    Ok(()) => return,
                    // worker exited between lookup and send
                    Err(mpsc::error::SendError(returned)) => envelope = returned,
                }
            }
            match self.try_spawn_worker(id, Some(envelope)) {
                None => return,
                Some(returned) => envelope = returned,
            }
        }
    }

    async fn submit(self: &Arc<Self>, id: SwapId, event: SwapEvent) -> Result<Transition, SwapError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(id, Envelope { event, reply: Some(reply_tx) }).await;
        reply_rx.await.map_err(|_| SwapError::WorkerStopped(id))?
    }

    async fn sweep_expired(self: &Arc<Self>) -> Result<usize, SwapError> {
        let now = Utc::now();
        let mut candidates = self.registry.list_active()?;
        candidates.extend(self.registry.list_by_state(SwapState::Forfeited)?);
        let mut due = Vec::new();
        for id in candidates {
            let swap = match self.registry.get(&id) {
                Ok(swap) => swap,
                Err(e) => {
                    warn!("Coordinator [{}]: sweep could not load swap: {}", id, e);
                    continue;
                }
            };
            if let Some(kind) = overdue_timeout(&swap, now) {
                due.push((id, kind));
            }
        }
        for (id, kind) in &due {
            self.enqueue(*id, Envelope::internal(SwapEvent::Timeout(*kind))).await;
        }
        if !due.is_empty() {
            info!("Coordinator: sweep enqueued {} overdue timeout(s)", due.len());
        }
        Ok(due.len())
    }
}

// Which timeout, if any, the swap is past without having acted on it
fn overdue_timeout(swap: &Swap, now: DateTime<Utc>) -> Option<TimeoutKind> {
    match swap.state {
        s if s.awaiting_confirmation() && now >= swap.lock_timeout => Some(TimeoutKind::Lock),
        SwapState::TargetLockConfirmed if now >= swap.reveal_timeout => Some(TimeoutKind::Reveal),
        SwapState::Forfeited
            if now >= swap.lock_timeout
                && swap.base_leg == BaseLeg::Locked
                && !swap.has_pending(|i| matches!(i, LedgerInstruction::Refund { .. })) =>
        {
            Some(TimeoutKind::Lock)
        }
        _ => None,
    }
}

// Aborts the wrapped tasks when dropped
struct BackgroundTasks(Vec<AbortHandle>);

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Handle to a running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct SwapCoordinator {
    inner: Arc<Inner>,
    _background: Arc<BackgroundTasks>,
}

impl SwapCoordinator {
    /// Validates the configuration and starts the timeout router and the
    /// periodic sweep. Must be called inside a tokio runtime. Existing swaps
    /// are not picked up until `resume` is called.
    pub fn start(deps: CoordinatorDeps) -> Result<Self, ConfigError> {
        deps.config.validate()?;
        let (clock, timer_rx) = TimeoutClock::new(deps.config.event_queue_capacity);
        let inner = Arc::new(Inner {
            registry: SwapRegistry::new(deps.store),
            crypto: deps.crypto,
            observer: deps.observer,
            executors: deps.executors,
            signing_key: deps.signing_key,
            oracle_key: deps.oracle_key,
            clock,
            workers: Mutex::new(HashMap::new()),
            config: deps.config,
        });

        let router = spawn_timer_router(Arc::downgrade(&inner), timer_rx);
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), inner.config.sweep_interval);
        info!(
            "Coordinator: started (threshold {}, fraud depth {}, signer {})",
            inner.config.confirmation_threshold,
            inner.config.fraud_reorg_depth,
            hex::encode(inner.signing_key.verifying_key().as_bytes())
        );
        Ok(SwapCoordinator { inner, _background: Arc::new(BackgroundTasks(vec![router, sweeper])) })
    }

    pub fn config(&self) -> &SwapConfig {
        &self.inner.config
    }

    pub async fn create_swap(&self, params: CreateSwapParams) -> Result<SwapId, SwapError> {
        let swap = self.inner.registry.create(params, &self.inner.ctx()).await?;
        self.inner.try_spawn_worker(swap.id, None);
        Ok(swap.id)
    }

    pub fn get_status(&self, id: &SwapId) -> Result<SwapState, SwapError> {
        Ok(self.inner.registry.get(id)?.state)
    }

    pub fn get_swap(&self, id: &SwapId) -> Result<Swap, SwapError> {
        self.inner.registry.get(id)
    }

    pub fn list_by_state(&self, state: SwapState) -> Result<Vec<SwapId>, SwapError> {
        self.inner.registry.list_by_state(state)
    }

    /// Refunds an expired swap. Fails with `NotYetExpired` before the
    /// applicable timeout.
    pub async fn request_refund(&self, id: &SwapId) -> Result<Transition, SwapError> {
        self.inner.submit(*id, SwapEvent::RefundRequested).await
    }

    pub async fn submit_collateral(&self, id: &SwapId, amount: u64, tx_ref: TxRef) -> Result<Transition, SwapError> {
        self.inner.submit(*id, SwapEvent::CollateralLocked { amount, tx_ref }).await
    }

    pub async fn submit_lock_evidence(&self, evidence: LockEvidence) -> Result<Transition, SwapError> {
        let id = evidence.swap_id;
        self.inner.submit(id, SwapEvent::LockObserved(evidence)).await
    }

    pub async fn submit_reveal(&self, id: &SwapId, signature: AdaptorSignature) -> Result<Transition, SwapError> {
        self.inner.submit(*id, SwapEvent::RevealSubmitted(signature)).await
    }

    pub async fn submit_fraud_proof(&self, proof: FraudProof) -> Result<Transition, SwapError> {
        let id = proof.swap_id;
        self.inner.submit(id, SwapEvent::FraudReported(proof)).await
    }

    // Workers close settled swaps themselves; this is for callers that
    // want the error when legs are still open.
    pub async fn close_swap(&self, id: &SwapId) -> Result<Transition, SwapError> {
        self.inner.submit(*id, SwapEvent::Close).await
    }

    /// Restarts workers for every swap that is not closed: timers are
    /// re-armed from the stored deadlines, watches restarted and pending
    /// outbox entries re-dispatched. Returns the number of swaps covered.
    pub fn resume(&self) -> Result<usize, SwapError> {
        let mut resumed = 0;
        for state in SwapState::ALL.iter().filter(|s| **s != SwapState::Closed) {
            for id in self.inner.registry.list_by_state(*state)? {
                self.inner.try_spawn_worker(id, None);
                resumed += 1;
            }
        }
        info!("Coordinator: resumed {} swap(s)", resumed);
        Ok(resumed)
    }

    /// Enqueues timeouts for swaps whose deadline has passed. Runs
    /// periodically on its own; exposed for tests and operators.
    pub async fn sweep_expired(&self) -> Result<usize, SwapError> {
        self.inner.sweep_expired().await
    }

    /// Stops every worker along with its timers, watches and dispatcher.
    /// Outbox entries stay persisted for the next `resume`.
    pub fn shutdown(&self) {
        let mut workers = lock_workers(&self.inner.workers);
        for (id, handle) in workers.drain() {
            debug!("Coordinator [{}]: stopping worker", id);
            handle.task.abort();
        }
    }
}

fn spawn_timer_router(inner: Weak<Inner>, mut rx: mpsc::Receiver<TimerToken>) -> AbortHandle {
    tokio::spawn(async move {
        while let Some(token) = rx.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            inner.enqueue(token.swap_id, Envelope::internal(SwapEvent::Timeout(token.kind))).await;
        }
    })
    .abort_handle()
}

fn spawn_sweeper(inner: Weak<Inner>, period: std::time::Duration) -> AbortHandle {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            if let Err(e) = inner.sweep_expired().await {
                error!("Coordinator: sweep failed: {}", e);
            }
        }
    })
    .abort_handle()
}

// Submits outbox entries one at a time, in sequence order, and reports
// each acknowledged one back to the worker.
fn spawn_dispatcher(
    id: SwapId,
    executors: Executors,
    key: SigningKey,
    retry: RetryPolicy,
    worker_tx: mpsc::Sender<Envelope>,
    withdrawn: WithdrawnSeqs,
) -> (mpsc::UnboundedSender<PendingInstruction>, AbortHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PendingInstruction>();
    let task = tokio::spawn(async move {
        let signer = key.verifying_key();
        while let Some(pending) = rx.recv().await {
            let seq = pending.seq;
            let kind = pending.instruction.kind();
            let executor = executors.for_ledger(pending.instruction.ledger()).clone();
            let signed = match SignedInstruction::sign(pending.instruction, &key) {
                Ok(signed) => signed,
                Err(e) => {
                    error!("Coordinator [{}]: could not sign {} #{}: {}", id, kind, seq, e);
                    continue;
                }
            };
            let label = format!("{} {} #{}", id, kind, seq);
            let (signed, signer, executor, withdrawn) = (&signed, &signer, executor.as_ref(), withdrawn.as_ref());
            // re-checked before every attempt so a withdrawal stops a retry loop
            let result = retry_with_backoff(&retry, &label, || async move {
                if is_withdrawn(withdrawn, seq) {
                    return Err(LedgerError::Withdrawn(seq));
                }
                dispatch_instruction(signed, signer, executor).await
            })
            .await;
            match result {
                Ok(tx_ref) => {
                    debug!("Coordinator [{}]: {} #{} acknowledged as {}", id, kind, seq, tx_ref);
                    let settled = SwapEvent::InstructionSettled { seq, tx_ref };
                    if worker_tx.send(Envelope::internal(settled)).await.is_err() {
                        break;
                    }
                }
                Err(LedgerError::Withdrawn(_)) => info!("Coordinator [{}]: {} #{} withdrawn, not submitted", id, kind, seq),
                // stays in the outbox; the next resume retries it
                Err(e) => error!("Coordinator [{}]: {} #{} failed permanently: {}", id, kind, seq, e),
            }
        }
    });
    (tx, task.abort_handle())
}

fn forward<T, F>(mut stream: futures::stream::BoxStream<'static, T>, tx: mpsc::Sender<Envelope>, into: F) -> AbortHandle
where
    T: Send + 'static,
    F: Fn(T) -> SwapEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            if tx.send(Envelope::internal(into(item))).await.is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

struct SwapWorker {
    id: SwapId,
    inner: Arc<Inner>,
    tx: mpsc::Sender<Envelope>,
    dispatch_tx: mpsc::UnboundedSender<PendingInstruction>,
    dispatcher: AbortHandle,
    dispatched: HashSet<u64>,
    withdrawn: WithdrawnSeqs,
    lock_timer: Option<TimerHandle>,
    reveal_timer: Option<TimerHandle>,
    lock_watch: Option<AbortHandle>,
    reorg_watch: Option<AbortHandle>,
    finished: bool,
}

impl Drop for SwapWorker {
    fn drop(&mut self) {
        self.stop_all();
        self.dispatcher.abort();
    }
}

impl SwapWorker {
    fn new(inner: Arc<Inner>, id: SwapId, tx: mpsc::Sender<Envelope>) -> Self {
        let withdrawn = WithdrawnSeqs::default();
        let (dispatch_tx, dispatcher) = spawn_dispatcher(
            id,
            inner.executors.clone(),
            inner.signing_key.clone(),
            inner.config.retry.clone(),
            tx.clone(),
            withdrawn.clone(),
        );
        SwapWorker {
            id,
            inner,
            tx,
            dispatch_tx,
            dispatcher,
            dispatched: HashSet::new(),
            withdrawn,
            lock_timer: None,
            reveal_timer: None,
            lock_watch: None,
            reorg_watch: None,
            finished: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>, first: Option<Envelope>) {
        self.reconcile().await;
        let mut next = first;
        loop {
            if let Some(envelope) = next.take() {
                self.handle(envelope).await;
            }
            if self.finished {
                break;
            }
            match rx.recv().await {
                Some(envelope) => next = Some(envelope),
                None => break,
            }
        }
        // late arrivals still get an answer before the worker goes away
        rx.close();
        self.inner.forget_worker(&self.id, &self.tx);
        while let Ok(envelope) = rx.try_recv() {
            self.handle(envelope).await;
        }
        debug!("Coordinator [{}]: worker exited", self.id);
    }

    async fn handle(&mut self, envelope: Envelope) {
        let name = envelope.event.name();
        let result = self.inner.registry.transition(&self.id, &envelope.event, &self.inner.ctx()).await;
        match &result {
            Ok(transition) if transition.changed => {
                if transition.previous != transition.state {
                    info!("Coordinator [{}]: {:?} -> {:?} on {}", self.id, transition.previous, transition.state, name);
                }
                if !self.finished {
                    self.reconcile().await;
                }
            }
            Ok(_) => debug!("Coordinator [{}]: {} was a no-op", self.id, name),
            Err(e) if envelope.reply.is_none() => warn!("Coordinator [{}]: {} rejected: {}", self.id, name, e),
            Err(_) => {}
        }
        if let Some(reply) = envelope.reply {
            let _ = reply.send(result);
        }
    }

    // Brings timers, watches and dispatch in line with the stored record
    async fn reconcile(&mut self) {
        let swap = match self.inner.registry.get(&self.id) {
            Ok(swap) => swap,
            Err(e) => {
                warn!("Coordinator [{}]: cannot load swap: {}", self.id, e);
                self.finish();
                return;
            }
        };
        if swap.state == SwapState::Closed {
            self.retire();
            return;
        }
        if swap.state.is_terminal() && swap.is_settled() {
            match self.inner.registry.transition(&self.id, &SwapEvent::Close, &self.inner.ctx()).await {
                Ok(_) => {
                    info!("Coordinator [{}]: {:?} and settled, closed", self.id, swap.state);
                    self.retire();
                }
                Err(e) => {
                    error!("Coordinator [{}]: close failed: {}", self.id, e);
                    self.finish();
                }
            }
            return;
        }

        if !swap.withdrawn.is_empty() {
            let mut withdrawn = self.withdrawn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            withdrawn.extend(swap.withdrawn.iter().map(|p| p.seq));
        }
        self.sync_timers(&swap);
        self.sync_watches(&swap);
        for pending in &swap.outbox {
            if self.dispatched.insert(pending.seq) && self.dispatch_tx.send(pending.clone()).is_err() {
                error!("Coordinator [{}]: dispatcher gone, #{} left in outbox", self.id, pending.seq);
            }
        }
    }

    fn sync_timers(&mut self, swap: &Swap) {
        let clock = &self.inner.clock;
        let id = self.id;
        toggle_timer(&mut self.lock_timer, swap.state.awaiting_confirmation(), || {
            clock.after(swap.lock_timeout, TimerToken { swap_id: id, kind: TimeoutKind::Lock })
        });
        toggle_timer(&mut self.reveal_timer, swap.state == SwapState::TargetLockConfirmed, || {
            clock.after(swap.reveal_timeout, TimerToken { swap_id: id, kind: TimeoutKind::Reveal })
        });
    }

    fn sync_watches(&mut self, swap: &Swap) {
        let watch_lock = matches!(swap.state, SwapState::CollateralLocked | SwapState::TargetLockObserved);
        if watch_lock && self.lock_watch.is_none() {
            debug!("Coordinator [{}]: watching target ledger for the lock", self.id);
            let stream = self.inner.observer.watch(self.id, swap.target_destination);
            self.lock_watch = Some(forward(stream, self.tx.clone(), SwapEvent::LockObserved));
        } else if !watch_lock {
            if let Some(task) = self.lock_watch.take() {
                task.abort();
            }
        }

        let watch_reorg = matches!(
            swap.state,
            SwapState::TargetLockObserved | SwapState::TargetLockConfirmed | SwapState::Revealed
        );
        match (&swap.target_lock_ref, watch_reorg) {
            (Some(lock_ref), true) if self.reorg_watch.is_none() => {
                debug!("Coordinator [{}]: watching {} for reorgs", self.id, lock_ref);
                let stream = self.inner.observer.watch_reorg(self.id, lock_ref.clone(), 1);
                self.reorg_watch = Some(forward(stream, self.tx.clone(), SwapEvent::FraudReported));
            }
            (_, false) => {
                if let Some(task) = self.reorg_watch.take() {
                    task.abort();
                }
            }
            _ => {}
        }
    }

    fn stop_all(&mut self) {
        for timer in [self.lock_timer.take(), self.reveal_timer.take()].into_iter().flatten() {
            timer.cancel();
        }
        for task in [self.lock_watch.take(), self.reorg_watch.take()].into_iter().flatten() {
            task.abort();
        }
    }

    fn finish(&mut self) {
        self.stop_all();
        self.finished = true;
    }

    // The swap is closed for good: nothing of it stays in the clock either
    fn retire(&mut self) {
        self.finish();
        self.inner.clock.forget(&self.id);
    }
}

fn toggle_timer(slot: &mut Option<TimerHandle>, wanted: bool, arm: impl FnOnce() -> TimerHandle) {
    match (wanted, slot.is_some()) {
        (true, false) => *slot = Some(arm()),
        (false, true) => {
            if let Some(timer) = slot.take() {
                timer.cancel();
            }
        }
        _ => {}
    }
}
