// Wall-clock deadlines for swaps.
//
// Each armed deadline is a tokio task that sleeps until the instant passes
// and then delivers its token on the clock's channel. A token is delivered
// at most once per clock, however many times it is armed. Cancelling only
// stops delivery; a token already queued is still seen by the receiver,
// which re-checks the deadline against the swap record.

use crate::data_structures::SwapId;
use crate::swap::types::TimeoutKind;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

// Upper bound on a single sleep so wall-clock jumps are noticed
const MAX_SLEEP: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub swap_id: SwapId,
    pub kind: TimeoutKind,
}

pub struct TimerHandle {
    abort: AbortHandle,
    pub token: TimerToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

#[derive(Clone)]
pub struct TimeoutClock {
    tx: mpsc::Sender<TimerToken>,
    fired: Arc<Mutex<HashSet<TimerToken>>>,
}

impl TimeoutClock {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TimerToken>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (TimeoutClock { tx, fired: Arc::new(Mutex::new(HashSet::new())) }, rx)
    }

    /// Arms `token` to fire once `deadline` has passed. Past deadlines fire
    /// immediately.
    pub fn after(&self, deadline: DateTime<Utc>, token: TimerToken) -> TimerHandle {
        let tx = self.tx.clone();
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            loop {
                let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    break;
                }
                trace!("TimeoutClock: {:?} for {} due in {:?}", token.kind, token.swap_id, remaining);
                tokio::time::sleep(remaining.min(MAX_SLEEP)).await;
            }
            let first = fired.lock().map(|mut set| set.insert(token)).unwrap_or(false);
            if first {
                debug!("TimeoutClock: {:?} timeout fired for swap {}", token.kind, token.swap_id);
                let _ = tx.send(token).await;
            }
        });
        TimerHandle { abort: task.abort_handle(), token }
    }

    /// Drops the fired record of every token for `swap_id`. Called once the
    /// swap is closed and none of its timers can be armed again.
    pub fn forget(&self, swap_id: &SwapId) {
        let mut fired = self.fired.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        fired.retain(|token| token.swap_id != *swap_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn token(kind: TimeoutKind) -> TimerToken {
        TimerToken { swap_id: SwapId([1u8; 32]), kind }
    }

    #[tokio::test]
    async fn fires_after_deadline() {
        let (clock, mut rx) = TimeoutClock::new(4);
        let _h = clock.after(Utc::now() + ChronoDuration::milliseconds(40), token(TimeoutKind::Lock));
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, token(TimeoutKind::Lock));
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately_and_only_once() {
        let (clock, mut rx) = TimeoutClock::new(4);
        let past = Utc::now() - ChronoDuration::seconds(5);
        let _a = clock.after(past, token(TimeoutKind::Reveal));
        let _b = clock.after(past, token(TimeoutKind::Reveal));
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_some());
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn forget_prunes_only_that_swap() {
        let (clock, mut rx) = TimeoutClock::new(4);
        let past = Utc::now() - ChronoDuration::seconds(1);
        let other = TimerToken { swap_id: SwapId([2u8; 32]), kind: TimeoutKind::Lock };
        let _a = clock.after(past, token(TimeoutKind::Lock));
        let _b = clock.after(past, other);
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        }
        assert_eq!(clock.fired.lock().unwrap().len(), 2);

        clock.forget(&SwapId([1u8; 32]));
        let fired = clock.fired.lock().unwrap().clone();
        assert_eq!(fired.into_iter().collect::<Vec<_>>(), vec![other]);
    }

    #[tokio::test]
    async fn cancelled_timer_is_silent() {
        let (clock, mut rx) = TimeoutClock::new(4);
        let handle = clock.after(Utc::now() + ChronoDuration::milliseconds(50), token(TimeoutKind::Lock));
        handle.cancel();
        assert!(tokio::time::timeout(Duration::from_millis(150), rx.recv()).await.is_err());
    }
}
