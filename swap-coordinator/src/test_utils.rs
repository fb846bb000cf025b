// swap-coordinator/src/test_utils.rs
// Shared fixtures for unit and integration tests

use crate::config::SwapConfig;
use crate::crypto::signing::keypair_from_seed;
use crate::crypto::{AdaptorMaterial, Ed25519Adaptor};
use crate::data_structures::{Destination, Direction, LedgerId, Party, SwapId};
use crate::ledger::interface::Executors;
use crate::ledger::mock::{MockExecutor, SimulatedTargetChain};
use crate::ledger::observer::PollingObserver;
use crate::ledger::retry::RetryPolicy;
use crate::storage::{InMemorySwapStore, SwapStore};
use crate::swap::coordinator::{CoordinatorDeps, SwapCoordinator};
use crate::swap::types::{CreateSwapParams, Swap};
use chrono::{Duration as ChronoDuration, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const OWNER_SEED: u8 = 0x11;
pub const COUNTERPARTY_SEED: u8 = 0x22;

// Deterministic keys for testing
pub fn oracle_key() -> SigningKey {
    keypair_from_seed(&[0x0a; 32])
}

pub fn coordinator_key() -> SigningKey {
    keypair_from_seed(&[0x0c; 32])
}

/// A party whose target key is a real curve point derived from `seed`.
pub fn test_party(seed: u8, account: &str) -> Party {
    Party {
        base_account: account.to_string(),
        target_key: keypair_from_seed(&[seed; 32]).verifying_key().to_bytes(),
    }
}

/// Defaults with fast polling and retries and no minimum lock window.
pub fn test_config() -> SwapConfig {
    SwapConfig {
        min_lock_window: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_secs(3600),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            max_attempts: None,
        },
        ..SwapConfig::default()
    }
}

// A swap request plus the adaptor material only the redeemer knows
#[derive(Clone, Debug)]
pub struct SwapFixture {
    pub params: CreateSwapParams,
    pub material: AdaptorMaterial,
}

impl SwapFixture {
    pub fn new(direction: Direction) -> Self {
        let material = AdaptorMaterial::generate(&mut OsRng);
        let now = Utc::now();
        let params = CreateSwapParams {
            direction,
            owner: test_party(OWNER_SEED, "0xowner"),
            counterparty: test_party(COUNTERPARTY_SEED, "0xcounterparty"),
            secret_commitment: material.commitment,
            adaptor_point: material.point,
            base_amount: 1_000_000,
            target_amount: 250_000,
            relayer_fee: 10_000,
            relayer: Some("0xrelayer".to_string()),
            lock_timeout: now + ChronoDuration::hours(1),
            reveal_timeout: now + ChronoDuration::hours(2),
            nonce: rand::random(),
        };
        SwapFixture { params, material }
    }

    /// Moves the lock timeout to `lock_in` from now; the reveal timeout
    /// follows one hour later.
    pub fn expire_soon(&mut self, lock_in: Duration) {
        let lock_in = ChronoDuration::from_std(lock_in).unwrap_or(ChronoDuration::zero());
        self.params.lock_timeout = Utc::now() + lock_in;
        self.params.reveal_timeout = self.params.lock_timeout + ChronoDuration::hours(1);
    }

    /// Sets both deadlines relative to now.
    pub fn with_deadlines(&mut self, lock_in: Duration, reveal_in: Duration) {
        let now = Utc::now();
        self.params.lock_timeout = now + ChronoDuration::from_std(lock_in).unwrap_or(ChronoDuration::zero());
        self.params.reveal_timeout = now + ChronoDuration::from_std(reveal_in).unwrap_or(ChronoDuration::zero());
    }
}

/// A freshly created record, not yet opened, for storage tests.
pub fn sample_swap(direction: Direction, nonce: u64) -> Swap {
    let mut fixture = SwapFixture::new(direction);
    fixture.params.nonce = nonce;
    let id = fixture.params.derive_id();
    let destination = Destination { spend_key: [nonce as u8; 32], view_key: [0x5a; 32] };
    Swap::new(id, fixture.params, destination, Utc::now())
}

// A coordinator wired to a mock base ledger and a simulated target chain
pub struct TestHarness {
    pub coordinator: SwapCoordinator,
    pub base: Arc<MockExecutor>,
    pub chain: Arc<SimulatedTargetChain>,
    pub store: Arc<dyn SwapStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemorySwapStore::new()))
    }

    pub fn with_store(store: Arc<dyn SwapStore>) -> Self {
        Self::with_parts(
            store,
            Arc::new(MockExecutor::new(LedgerId::Base)),
            Arc::new(SimulatedTargetChain::new(oracle_key())),
        )
    }

    /// Builds a coordinator over existing ledgers, as after a restart.
    pub fn with_parts(store: Arc<dyn SwapStore>, base: Arc<MockExecutor>, chain: Arc<SimulatedTargetChain>) -> Self {
        let config = test_config();
        let observer = PollingObserver::new(chain.clone(), config.poll_interval, config.retry.clone());
        let deps = CoordinatorDeps {
            config,
            store: store.clone(),
            crypto: Arc::new(Ed25519Adaptor),
            observer: Arc::new(observer),
            executors: Executors::new(base.clone(), chain.clone()),
            signing_key: coordinator_key(),
            oracle_key: oracle_key().verifying_key(),
        };
        let coordinator = match SwapCoordinator::start(deps) {
            Ok(coordinator) => coordinator,
            Err(e) => panic!("test config rejected: {}", e),
        };
        TestHarness { coordinator, base, chain, store }
    }

    /// Polls the stored record until `pred` holds, panicking after five seconds.
    pub async fn wait_for(&self, id: &SwapId, pred: impl Fn(&Swap) -> bool) -> Swap {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let swap = match self.coordinator.get_swap(id) {
                Ok(swap) => swap,
                Err(e) => panic!("swap {} unavailable: {}", id, e),
            };
            if pred(&swap) {
                return swap;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting on swap {}: state {:?}, base {:?}, collateral {:?}, outbox {}",
                    id,
                    swap.state,
                    swap.base_leg,
                    swap.collateral,
                    swap.outbox.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
