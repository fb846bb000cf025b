// swap-coordinator/src/storage/sled_store.rs
//
// Durable swap records in a sled tree, one JSON document per swap keyed by
// the raw 32-byte id. Writes are flushed before returning so an
// acknowledged transition survives a crash.

use super::{StoreError, SwapStore};
use crate::data_structures::SwapId;
use crate::swap::types::{Swap, SwapState};
use log::{debug, info};
use sled::{Db, Tree};
use std::path::Path;

const SWAPS_TREE: &str = "swaps";

pub struct SledSwapStore {
    db: Db,
    swaps: Tree,
}

impl SledSwapStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let swaps = db.open_tree(SWAPS_TREE)?;
        info!("SledSwapStore: opened {} with {} swaps", path.as_ref().display(), swaps.len());
        Ok(SledSwapStore { db, swaps })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl SwapStore for SledSwapStore {
    fn load(&self, id: &SwapId) -> Result<Option<Swap>, StoreError> {
        match self.swaps.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_new(&self, swap: &Swap) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(swap)?;
        self.swaps
            .compare_and_swap(swap.id.as_bytes(), None as Option<&[u8]>, Some(encoded))?
            .map_err(|_| StoreError::AlreadyExists(swap.id))?;
        self.flush()?;
        debug!("SledSwapStore: inserted swap {}", swap.id);
        Ok(())
    }

    fn update(&self, swap: &Swap, expected_version: u64) -> Result<(), StoreError> {
        let current = self.swaps.get(swap.id.as_bytes())?.ok_or(StoreError::Missing(swap.id))?;
        let stored: Swap = serde_json::from_slice(&current)?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict { expected: expected_version, found: stored.version });
        }
        let encoded = serde_json::to_vec(swap)?;
        // a concurrent writer between the read and the swap shows up as a conflict
        if self
            .swaps
            .compare_and_swap(swap.id.as_bytes(), Some(current), Some(encoded))?
            .is_err()
        {
            let found = self.load(&swap.id)?.map_or(expected_version, |s| s.version);
            return Err(StoreError::VersionConflict { expected: expected_version, found });
        }
        self.flush()?;
        debug!("SledSwapStore: swap {} now at version {}", swap.id, swap.version);
        Ok(())
    }

    fn ids_in_state(&self, state: SwapState) -> Result<Vec<SwapId>, StoreError> {
        let mut ids = Vec::new();
        for entry in self.swaps.iter() {
            let (_, bytes) = entry?;
            let swap: Swap = serde_json::from_slice(&bytes)?;
            if swap.state == state {
                ids.push(swap.id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::Direction;
    use crate::test_utils::sample_swap;
    use tempfile::tempdir;

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let mut swap = sample_swap(Direction::BaseToTarget, 7);
        {
            let store = SledSwapStore::open(dir.path()).unwrap();
            store.insert_new(&swap).unwrap();
            swap.state = SwapState::CollateralLocked;
            swap.version = 1;
            store.update(&swap, 0).unwrap();
        }
        let store = SledSwapStore::open(dir.path()).unwrap();
        assert_eq!(store.swaps.len(), 1);
        assert_eq!(store.load(&swap.id).unwrap(), Some(swap.clone()));
        assert_eq!(store.ids_in_state(SwapState::CollateralLocked).unwrap(), vec![swap.id]);
    }

    #[test]
    fn duplicate_insert_and_stale_update_fail() {
        let dir = tempdir().unwrap();
        let store = SledSwapStore::open(dir.path()).unwrap();
        let mut swap = sample_swap(Direction::TargetToBase, 8);
        store.insert_new(&swap).unwrap();
        assert!(matches!(store.insert_new(&swap), Err(StoreError::AlreadyExists(_))));

        swap.version = 1;
        store.update(&swap, 0).unwrap();
        assert!(matches!(store.update(&swap, 0), Err(StoreError::VersionConflict { .. })));
        assert!(store.load(&SwapId([0xee; 32])).unwrap().is_none());
    }
}
