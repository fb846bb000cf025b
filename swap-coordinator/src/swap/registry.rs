// Durable swap records with per-swap serialization.
//
// Transitions on one swap run one at a time under that swap's lock;
// different swaps proceed in parallel. A rejected event leaves the stored
// record exactly as it was.

use crate::data_structures::SwapId;
use crate::storage::{StoreError, SwapStore};
use crate::swap::state_machine::{self, TransitionContext};
use crate::swap::types::{CreateSwapParams, Swap, SwapError, SwapEvent, SwapState, Transition};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SwapRegistry {
    store: Arc<dyn SwapStore>,
    locks: Mutex<HashMap<SwapId, Arc<Mutex<()>>>>,
}

impl SwapRegistry {
    pub fn new(store: Arc<dyn SwapStore>) -> Self {
        SwapRegistry { store, locks: Mutex::new(HashMap::new()) }
    }

    async fn key_lock(&self, id: &SwapId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(*id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Validates, derives id and destination, issues opening instructions
    /// and persists the new record.
    pub async fn create(&self, params: CreateSwapParams, ctx: &TransitionContext<'_>) -> Result<Swap, SwapError> {
        state_machine::validate_params(&params, ctx)?;
        let id = params.derive_id();
        let guard = self.key_lock(&id).await;
        let _held = guard.lock().await;

        let result = self.create_locked(id, params, ctx);
        match &result {
            Ok(_) | Err(SwapError::IdCollision(_)) => {}
            Err(_) => {
                self.locks.lock().await.remove(&id);
            }
        }
        result
    }

    fn create_locked(
        &self,
        id: SwapId,
        params: CreateSwapParams,
        ctx: &TransitionContext<'_>,
    ) -> Result<Swap, SwapError> {
        let destination = ctx.crypto.derive_one_time_destination(
            &params.owner.target_key,
            &params.counterparty.target_key,
            &id,
        )?;
        let mut swap = Swap::new(id, params, destination, ctx.now);
        let opened = state_machine::open(&mut swap);
        match self.store.insert_new(&swap) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(id)) => return Err(SwapError::IdCollision(id)),
            Err(e) => return Err(e.into()),
        }
        info!(
            "Registry: created swap {} ({:?}, base {} / target {}, {} opening instruction(s))",
            id,
            swap.direction,
            swap.base_amount,
            swap.target_amount,
            opened.len()
        );
        Ok(swap)
    }

    pub async fn transition(
        &self,
        id: &SwapId,
        event: &SwapEvent,
        ctx: &TransitionContext<'_>,
    ) -> Result<Transition, SwapError> {
        let guard = self.key_lock(id).await;
        let _held = guard.lock().await;

        let result = self.transition_locked(id, event, ctx);
        // closed and unknown swaps take no further writes, so their lock goes
        let retired = match &result {
            Ok(transition) => transition.state == SwapState::Closed,
            Err(SwapError::NotFound(_)) | Err(SwapError::Closed(_)) => true,
            Err(_) => false,
        };
        if retired {
            self.locks.lock().await.remove(id);
        }
        result
    }

    fn transition_locked(
        &self,
        id: &SwapId,
        event: &SwapEvent,
        ctx: &TransitionContext<'_>,
    ) -> Result<Transition, SwapError> {
        let stored = self.store.load(id)?.ok_or(SwapError::NotFound(*id))?;
        let mut working = stored.clone();
        let applied = state_machine::apply(&mut working, event, ctx)?;

        if applied.changed {
            working.version = stored.version + 1;
            self.store.update(&working, stored.version)?;
            debug!("Registry: swap {} {} -> version {}", id, event.name(), working.version);
        }
        Ok(Transition {
            swap_id: *id,
            previous: stored.state,
            state: working.state,
            changed: applied.changed,
            issued: applied.issued,
            version: working.version,
        })
    }

    pub fn get(&self, id: &SwapId) -> Result<Swap, SwapError> {
        self.store.load(id)?.ok_or(SwapError::NotFound(*id))
    }

    pub fn list_by_state(&self, state: SwapState) -> Result<Vec<SwapId>, SwapError> {
        Ok(self.store.ids_in_state(state)?)
    }

    // every swap that is not yet terminal
    pub fn list_active(&self) -> Result<Vec<SwapId>, SwapError> {
        let mut ids = Vec::new();
        for state in SwapState::ALL.iter().filter(|s| s.is_active()) {
            ids.extend(self.store.ids_in_state(*state)?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwapConfig;
    use crate::crypto::Ed25519Adaptor;
    use crate::data_structures::{Direction, TxRef};
    use crate::storage::InMemorySwapStore;
    use crate::test_utils::{oracle_key, test_config, SwapFixture};
    use chrono::Utc;
    use ed25519_dalek::VerifyingKey;

    struct Env {
        config: SwapConfig,
        crypto: Ed25519Adaptor,
        oracle: VerifyingKey,
    }

    impl Env {
        fn new() -> Self {
            Env { config: test_config(), crypto: Ed25519Adaptor, oracle: oracle_key().verifying_key() }
        }

        fn ctx(&self) -> TransitionContext<'_> {
            TransitionContext { config: &self.config, crypto: &self.crypto, oracle_key: &self.oracle, now: Utc::now() }
        }
    }

    #[tokio::test]
    async fn create_persists_and_rejects_repeat() {
        let env = Env::new();
        let registry = SwapRegistry::new(Arc::new(InMemorySwapStore::new()));
        let fixture = SwapFixture::new(Direction::BaseToTarget);

        let swap = registry.create(fixture.params.clone(), &env.ctx()).await.unwrap();
        assert_eq!(swap.id, fixture.params.derive_id());
        assert_eq!(registry.get(&swap.id).unwrap().outbox.len(), 1);

        let again = registry.create(fixture.params.clone(), &env.ctx()).await;
        assert!(matches!(again, Err(SwapError::IdCollision(_))));
        assert_eq!(registry.list_active().unwrap(), vec![swap.id]);
    }

    #[tokio::test]
    async fn rejected_event_leaves_record_untouched() {
        let env = Env::new();
        let registry = SwapRegistry::new(Arc::new(InMemorySwapStore::new()));
        let swap = registry.create(SwapFixture::new(Direction::BaseToTarget).params, &env.ctx()).await.unwrap();

        let bad = SwapEvent::CollateralLocked { amount: 1, tx_ref: TxRef::from("c") };
        assert!(registry.transition(&swap.id, &bad, &env.ctx()).await.is_err());
        assert_eq!(registry.get(&swap.id).unwrap(), swap);

        let good = SwapEvent::CollateralLocked { amount: swap.target_amount, tx_ref: TxRef::from("c") };
        let t = registry.transition(&swap.id, &good, &env.ctx()).await.unwrap();
        assert_eq!((t.previous, t.state, t.version), (SwapState::Created, SwapState::CollateralLocked, 1));

        // replay does not bump the version
        let t = registry.transition(&swap.id, &good, &env.ctx()).await.unwrap();
        assert!(!t.changed);
        assert_eq!(registry.get(&swap.id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn concurrent_events_are_serialized() {
        let env = Arc::new(Env::new());
        let registry = Arc::new(SwapRegistry::new(Arc::new(InMemorySwapStore::new())));
        let swap = registry.create(SwapFixture::new(Direction::BaseToTarget).params, &env.ctx()).await.unwrap();

        let id = swap.id;
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let env = env.clone();
            let event = SwapEvent::CollateralLocked { amount: swap.target_amount, tx_ref: TxRef(format!("c{}", i)) };
            handles.push(tokio::spawn(async move { registry.transition(&id, &event, &env.ctx()).await }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(registry.get(&id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn unknown_swap_is_not_found() {
        let env = Env::new();
        let registry = SwapRegistry::new(Arc::new(InMemorySwapStore::new()));
        let err = registry.transition(&SwapId([1u8; 32]), &SwapEvent::Close, &env.ctx()).await.unwrap_err();
        assert!(matches!(err, SwapError::NotFound(_)));
        assert!(registry.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn closing_a_swap_drops_its_key_lock() {
        let env = Env::new();
        let store = Arc::new(InMemorySwapStore::new());
        let registry = SwapRegistry::new(store.clone());
        let swap = registry.create(SwapFixture::new(Direction::TargetToBase).params, &env.ctx()).await.unwrap();
        assert_eq!(registry.locks.lock().await.len(), 1);

        // a target-first swap refunded before anything moved has no open legs
        let mut refunded = registry.get(&swap.id).unwrap();
        refunded.state = SwapState::Refunded;
        refunded.version = 1;
        store.update(&refunded, 0).unwrap();

        let t = registry.transition(&swap.id, &SwapEvent::Close, &env.ctx()).await.unwrap();
        assert_eq!(t.state, SwapState::Closed);
        assert!(registry.locks.lock().await.is_empty());

        let err = registry.transition(&swap.id, &SwapEvent::Close, &env.ctx()).await.unwrap_err();
        assert!(matches!(err, SwapError::Closed(_)));
        assert!(registry.locks.lock().await.is_empty());
    }
}
