// Swap record persistence.
//
// Records are written with optimistic concurrency: every update names the
// version it was derived from and fails if the stored copy moved on.

pub mod sled_store;

use crate::data_structures::SwapId;
use crate::swap::types::{Swap, SwapState};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

pub use sled_store::SledSwapStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("swap {0} already stored")]
    AlreadyExists(SwapId),
    #[error("swap {0} not stored")]
    Missing(SwapId),
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
}

pub trait SwapStore: Send + Sync {
    fn load(&self, id: &SwapId) -> Result<Option<Swap>, StoreError>;

    // Fails with AlreadyExists if the id is taken
    fn insert_new(&self, swap: &Swap) -> Result<(), StoreError>;

    /// Replaces the record iff the stored version equals `expected_version`.
    fn update(&self, swap: &Swap, expected_version: u64) -> Result<(), StoreError>;

    fn ids_in_state(&self, state: SwapState) -> Result<Vec<SwapId>, StoreError>;
}

// In-memory store for tests and single-process runs
#[derive(Debug, Default)]
pub struct InMemorySwapStore {
    swaps: RwLock<HashMap<SwapId, Swap>>,
}

impl InMemorySwapStore {
    pub fn new() -> Self {
        Default::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SwapId, Swap>> {
        self.swaps.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SwapId, Swap>> {
        self.swaps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SwapStore for InMemorySwapStore {
    fn load(&self, id: &SwapId) -> Result<Option<Swap>, StoreError> {
        Ok(self.read().get(id).cloned())
    }

    fn insert_new(&self, swap: &Swap) -> Result<(), StoreError> {
        let mut swaps = self.write();
        if swaps.contains_key(&swap.id) {
            return Err(StoreError::AlreadyExists(swap.id));
        }
        swaps.insert(swap.id, swap.clone());
        Ok(())
    }

    fn update(&self, swap: &Swap, expected_version: u64) -> Result<(), StoreError> {
        let mut swaps = self.write();
        let stored = swaps.get_mut(&swap.id).ok_or(StoreError::Missing(swap.id))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict { expected: expected_version, found: stored.version });
        }
        *stored = swap.clone();
        Ok(())
    }

    fn ids_in_state(&self, state: SwapState) -> Result<Vec<SwapId>, StoreError> {
        let mut ids: Vec<SwapId> = self.read().values().filter(|s| s.state == state).map(|s| s.id).collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::Direction;
    use crate::test_utils::sample_swap;

    #[test]
    fn insert_is_exclusive() {
        let store = InMemorySwapStore::new();
        let swap = sample_swap(Direction::BaseToTarget, 1);
        store.insert_new(&swap).unwrap();
        assert!(matches!(store.insert_new(&swap), Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.load(&swap.id).unwrap(), Some(swap));
    }

    #[test]
    fn stale_update_is_rejected() {
        let store = InMemorySwapStore::new();
        let mut swap = sample_swap(Direction::BaseToTarget, 2);
        store.insert_new(&swap).unwrap();

        swap.version = 1;
        store.update(&swap, 0).unwrap();
        let err = store.update(&swap, 0).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, found: 1 }));
    }

    #[test]
    fn lists_by_state() {
        let store = InMemorySwapStore::new();
        let a = sample_swap(Direction::BaseToTarget, 3);
        let mut b = sample_swap(Direction::TargetToBase, 4);
        b.state = SwapState::Refunded;
        store.insert_new(&a).unwrap();
        store.insert_new(&b).unwrap();
        assert_eq!(store.ids_in_state(SwapState::Created).unwrap(), vec![a.id]);
        assert_eq!(store.ids_in_state(SwapState::Refunded).unwrap(), vec![b.id]);
        assert!(store.ids_in_state(SwapState::Closed).unwrap().is_empty());
    }
}
