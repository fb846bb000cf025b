// Lazy, cancellable streams of target-ledger observations.
//
// Dropping a stream cancels the watch. RPC failures back off and retry;
// an unreachable ledger produces no items rather than stale ones.

use crate::data_structures::{Destination, OutputRef, SwapId};
use crate::ledger::interface::LedgerError;
use crate::ledger::retry::RetryPolicy;
use crate::swap::evidence::{FraudProof, LockEvidence};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Block-data feed for the target ledger (oracle or node RPC).
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current view of the lock paying to `destination`, if one exists.
    async fn lock_status(
        &self,
        swap_id: &SwapId,
        destination: &Destination,
    ) -> Result<Option<LockEvidence>, LedgerError>;

    /// Reorgs at depth >= `min_depth` that displaced `lock_ref`.
    async fn reorg_candidates(
        &self,
        swap_id: &SwapId,
        lock_ref: &OutputRef,
        min_depth: u64,
    ) -> Result<Vec<FraudProof>, LedgerError>;
}

pub trait LedgerObserver: Send + Sync {
    fn watch(&self, swap_id: SwapId, destination: Destination) -> BoxStream<'static, LockEvidence>;

    fn watch_reorg(&self, swap_id: SwapId, lock_ref: OutputRef, min_depth: u64) -> BoxStream<'static, FraudProof>;
}

pub struct PollingObserver {
    source: Arc<dyn BlockSource>,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl PollingObserver {
    pub fn new(source: Arc<dyn BlockSource>, poll_interval: Duration, retry: RetryPolicy) -> Self {
        PollingObserver { source, poll_interval, retry }
    }
}

struct PollState<T> {
    source: Arc<dyn BlockSource>,
    poll_interval: Duration,
    retry: RetryPolicy,
    first: bool,
    failures: u32,
    seen: T,
}

impl<T> PollState<T> {
    // Waits before the next poll: nothing on the first poll, backoff after
    // failures, the normal interval otherwise.
    async fn pause(&mut self) {
        if self.first {
            self.first = false;
        } else if self.failures > 0 {
            tokio::time::sleep(self.retry.delay_for(self.failures)).await;
        } else {
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl LedgerObserver for PollingObserver {
    fn watch(&self, swap_id: SwapId, destination: Destination) -> BoxStream<'static, LockEvidence> {
        let state = PollState {
            source: self.source.clone(),
            poll_interval: self.poll_interval,
            retry: self.retry.clone(),
            first: true,
            failures: 0,
            seen: None::<LockEvidence>,
        };
        stream::unfold(state, move |mut st| async move {
            loop {
                st.pause().await;
                match st.source.lock_status(&swap_id, &destination).await {
                    Ok(Some(evidence)) if st.seen.as_ref() != Some(&evidence) => {
                        st.failures = 0;
                        debug!("Observer [{}]: lock {} at {} confirmations", swap_id, evidence.lock_ref, evidence.confirmations);
                        st.seen = Some(evidence.clone());
                        return Some((evidence, st));
                    }
                    Ok(_) => st.failures = 0,
                    Err(e) => {
                        st.failures = st.failures.saturating_add(1);
                        warn!("Observer [{}]: lock status query failed ({}), attempt {}", swap_id, e, st.failures);
                    }
                }
            }
        })
        .boxed()
    }

    fn watch_reorg(&self, swap_id: SwapId, lock_ref: OutputRef, min_depth: u64) -> BoxStream<'static, FraudProof> {
        let state = PollState {
            source: self.source.clone(),
            poll_interval: self.poll_interval,
            retry: self.retry.clone(),
            first: true,
            failures: 0,
            seen: (HashSet::new(), Vec::<FraudProof>::new()),
        };
        stream::unfold(state, move |mut st| {
            let lock_ref = lock_ref.clone();
            async move {
                loop {
                    if let Some(proof) = st.seen.1.pop() {
                        return Some((proof, st));
                    }
                    st.pause().await;
                    match st.source.reorg_candidates(&swap_id, &lock_ref, min_depth).await {
                        Ok(proofs) => {
                            st.failures = 0;
                            for proof in proofs {
                                if st.seen.0.insert(proof.replacement.clone()) {
                                    warn!("Observer [{}]: reorg of {} at depth {}", swap_id, proof.original, proof.reorg_depth);
                                    st.seen.1.push(proof);
                                }
                            }
                        }
                        Err(e) => {
                            st.failures = st.failures.saturating_add(1);
                            warn!("Observer [{}]: reorg query failed ({}), attempt {}", swap_id, e, st.failures);
                        }
                    }
                }
            }
        })
        .boxed()
    }
}
