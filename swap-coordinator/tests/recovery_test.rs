// swap-coordinator/tests/recovery_test.rs
//
// Restart and ledger-failure behaviour: persisted records, pending outbox
// entries and transient executor errors.

use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use swap_coordinator::crypto::signing::keypair_from_seed;
use swap_coordinator::data_structures::{Direction, LedgerId, TxRef};
use swap_coordinator::ledger::mock::{MockExecutor, SimulatedTargetChain, SubmissionKind};
use swap_coordinator::storage::{SledSwapStore, SwapStore};
use swap_coordinator::swap::types::{BaseLeg, SwapState};
use swap_coordinator::test_utils::{oracle_key, SwapFixture, TestHarness};
use tempfile::tempdir;

#[tokio::test]
async fn test_transient_base_ledger_failures_are_retried() {
    let h = TestHarness::new();
    h.base.fail_next(3);
    let fixture = SwapFixture::new(Direction::BaseToTarget);
    let id = h.coordinator.create_swap(fixture.params.clone()).await.unwrap();

    let swap = h.wait_for(&id, |s| s.base_leg == BaseLeg::Locked).await;
    assert_eq!(swap.state, SwapState::Created);
    assert_eq!(h.base.count(SubmissionKind::Lock, &id), 1);
    assert!(h.base.attempts() >= 4);
}

#[tokio::test]
async fn test_unreachable_target_ledger_stalls_without_failing() {
    let h = TestHarness::new();
    let fixture = SwapFixture::new(Direction::BaseToTarget);
    let id = h.coordinator.create_swap(fixture.params.clone()).await.unwrap();
    h.wait_for(&id, |s| s.base_leg == BaseLeg::Locked).await;

    h.chain.set_unreachable(true);
    h.coordinator
        .submit_collateral(&id, fixture.params.target_amount, TxRef::from("collateral-tx"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let swap = h.coordinator.get_swap(&id).unwrap();
    assert_eq!(swap.state, SwapState::CollateralLocked);
    assert_eq!(swap.outbox.len(), 1);

    h.chain.set_unreachable(false);
    h.wait_for(&id, |s| s.target_lock_tx.is_some()).await;
    h.chain.mine(10);
    h.wait_for(&id, |s| s.state == SwapState::TargetLockConfirmed).await;
}

#[tokio::test]
async fn test_restart_resumes_from_sled() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SwapStore> = Arc::new(SledSwapStore::open(dir.path()).unwrap());
    let base = Arc::new(MockExecutor::new(LedgerId::Base));
    let chain = Arc::new(SimulatedTargetChain::new(oracle_key()));
    let fixture = SwapFixture::new(Direction::BaseToTarget);

    let id = {
        let first = TestHarness::with_parts(store.clone(), base.clone(), chain.clone());
        let id = first.coordinator.create_swap(fixture.params.clone()).await.unwrap();
        first.wait_for(&id, |s| s.base_leg == BaseLeg::Locked).await;

        // the target ledger is down when the collateral arrives, so the
        // target lock is still in the outbox when the process stops
        chain.set_unreachable(true);
        first
            .coordinator
            .submit_collateral(&id, fixture.params.target_amount, TxRef::from("collateral-tx"))
            .await
            .unwrap();
        first.coordinator.shutdown();
        id
    };

    let persisted = store.load(&id).unwrap().unwrap();
    assert_eq!(persisted.state, SwapState::CollateralLocked);
    assert_eq!(persisted.outbox.len(), 1);

    chain.set_unreachable(false);
    let second = TestHarness::with_parts(store.clone(), base.clone(), chain.clone());
    assert_eq!(second.coordinator.resume().unwrap(), 1);
    second.wait_for(&id, |s| s.target_lock_tx.is_some()).await;
    chain.mine(10);
    second.wait_for(&id, |s| s.state == SwapState::TargetLockConfirmed).await;

    let signature = fixture.material.complete(&mut OsRng).unwrap();
    second.coordinator.submit_reveal(&id, signature).await.unwrap();
    let swap = second.wait_for(&id, |s| s.state == SwapState::Closed).await;
    assert_eq!(swap.base_leg, BaseLeg::Released);

    // nothing was submitted twice across the restart
    assert_eq!(base.count(SubmissionKind::Lock, &id), 1);
    assert_eq!(base.count(SubmissionKind::Reveal, &id), 1);
    assert_eq!(base.count(SubmissionKind::CollateralReturn, &id), 1);
    assert!(second.coordinator.resume().unwrap() == 0);
}

#[tokio::test]
async fn test_fraud_proof_from_unknown_oracle_is_rejected() {
    let h = TestHarness::new();
    let fixture = SwapFixture::new(Direction::BaseToTarget);
    let id = h.coordinator.create_swap(fixture.params.clone()).await.unwrap();
    h.wait_for(&id, |s| s.base_leg == BaseLeg::Locked).await;
    h.coordinator
        .submit_collateral(&id, fixture.params.target_amount, TxRef::from("collateral-tx"))
        .await
        .unwrap();
    h.wait_for(&id, |s| s.target_lock_tx.is_some()).await;
    h.chain.mine(10);
    let swap = h.wait_for(&id, |s| s.state == SwapState::TargetLockConfirmed).await;

    // a second chain with a different oracle key signs a convincing proof
    let rogue = SimulatedTargetChain::new(keypair_from_seed(&[0x66; 32]));
    let lock_ref = rogue.lock_output(id, swap.target_destination, fixture.params.target_amount);
    rogue.mine(12);
    let mut proof = rogue.reorg_lock(&lock_ref, 12, fixture.params.counterparty.target_key).unwrap();
    proof.original = swap.target_lock_ref.clone().unwrap();

    assert!(h.coordinator.submit_fraud_proof(proof).await.is_err());
    assert_eq!(h.coordinator.get_status(&id).unwrap(), SwapState::TargetLockConfirmed);
    assert_eq!(h.base.count(SubmissionKind::Forfeit, &id), 0);
}
