//! Implementation of an in-memory checkpoint store.
//!
//! Survives partition crashes but not the process. Useful in tests
//! and when the input can be replayed from the start anyway.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::StoreError;
use crate::partition::PartitionIndex;
use crate::recovery::{CheckpointId, CheckpointMeta};

use super::CheckpointStore;

#[derive(Debug, Default)]
struct Tables {
    snaps: BTreeMap<(CheckpointId, PartitionIndex), Vec<u8>>,
    commits: BTreeMap<CheckpointId, CheckpointMeta>,
}

/// A checkpoint store with all data in memory.
#[derive(Debug, Default)]
pub struct InMemCheckpointStore {
    tables: Mutex<Tables>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of snapshots held, complete or not.
    pub fn snapshot_count(&self) -> usize {
        self.tables().map(|t| t.snaps.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn force_complete(&self, meta: CheckpointMeta) {
        self.tables()
            .unwrap()
            .commits
            .insert(meta.checkpoint_id, meta);
    }
}

impl CheckpointStore for InMemCheckpointStore {
    fn put(
        &self,
        partition: PartitionIndex,
        checkpoint: CheckpointId,
        blob: &[u8],
    ) -> Result<(), StoreError> {
        tracing::trace!("Writing snapshot {checkpoint:?} for {partition:?}");
        self.tables()?
            .snaps
            .insert((checkpoint, partition), blob.to_vec());
        Ok(())
    }

    fn mark_complete(&self, meta: &CheckpointMeta) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let found = meta
            .partition_count
            .iter()
            .filter(|part| tables.snaps.contains_key(&(meta.checkpoint_id, *part)))
            .count();
        if found != meta.partition_count.0 {
            return Err(StoreError::Incomplete {
                checkpoint: meta.checkpoint_id,
                found,
                expected: meta.partition_count.0,
            });
        }
        tables.commits.insert(meta.checkpoint_id, meta.clone());
        Ok(())
    }

    fn latest_complete_meta(&self) -> Result<Option<CheckpointMeta>, StoreError> {
        Ok(self.tables()?.commits.values().next_back().cloned())
    }

    fn latest_complete(
        &self,
        partition: PartitionIndex,
    ) -> Result<Option<(CheckpointId, Vec<u8>)>, StoreError> {
        let tables = self.tables()?;
        let found = tables.commits.keys().rev().find_map(|checkpoint| {
            tables
                .snaps
                .get(&(*checkpoint, partition))
                .map(|blob| (*checkpoint, blob.clone()))
        });
        Ok(found)
    }

    fn garbage_collect(&self, older_than: CheckpointId) -> Result<usize, StoreError> {
        let mut tables = self.tables()?;
        let before = tables.snaps.len();
        tables
            .snaps
            .retain(|(checkpoint, _), _| *checkpoint >= older_than);
        tables
            .commits
            .retain(|checkpoint, _| *checkpoint >= older_than);
        Ok(before - tables.snaps.len())
    }
}

#[cfg(test)]
use crate::inputs::Offset;
#[cfg(test)]
use crate::partition::PartitionCount;

#[cfg(test)]
fn meta(id: u64, count: usize) -> CheckpointMeta {
    CheckpointMeta {
        checkpoint_id: CheckpointId(id),
        partition_count: PartitionCount(count),
        input_offset: Offset(id * 10),
    }
}

#[test]
fn incomplete_checkpoint_not_committed() {
    let store = InMemCheckpointStore::new();
    store
        .put(PartitionIndex(0), CheckpointId(1), b"zero")
        .unwrap();

    let found = store.mark_complete(&meta(1, 2));
    assert!(matches!(
        found,
        Err(StoreError::Incomplete {
            found: 1,
            expected: 2,
            ..
        })
    ));
    assert_eq!(store.latest_complete_meta().unwrap(), None);
    assert_eq!(store.latest_complete(PartitionIndex(0)).unwrap(), None);
}

#[test]
fn latest_complete_skips_uncommitted() {
    let store = InMemCheckpointStore::new();
    store.put(PartitionIndex(0), CheckpointId(1), b"one").unwrap();
    store.mark_complete(&meta(1, 1)).unwrap();
    store.put(PartitionIndex(0), CheckpointId(2), b"two").unwrap();

    assert_eq!(
        store.latest_complete(PartitionIndex(0)).unwrap(),
        Some((CheckpointId(1), b"one".to_vec()))
    );
    assert_eq!(store.latest_complete_meta().unwrap(), Some(meta(1, 1)));
}

#[test]
fn garbage_collect_works() {
    let store = InMemCheckpointStore::new();
    for id in 1..=3 {
        store
            .put(PartitionIndex(0), CheckpointId(id), b"snap")
            .unwrap();
    }
    store.mark_complete(&meta(1, 1)).unwrap();
    store.mark_complete(&meta(3, 1)).unwrap();

    let removed = store.garbage_collect(CheckpointId(3)).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.snapshot_count(), 1);
    assert_eq!(store.latest_complete_meta().unwrap(), Some(meta(3, 1)));
}
