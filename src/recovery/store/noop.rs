//! A checkpoint store which does nothing.

use crate::errors::StoreError;
use crate::partition::PartitionIndex;
use crate::recovery::{CheckpointId, CheckpointMeta};

use super::CheckpointStore;

/// Writes are dropped and reads are the same as an empty store.
///
/// Used when a pipeline runs without recovery; every run starts from
/// the beginning of the input.
#[derive(Debug, Default)]
pub struct NoOpStore;

impl NoOpStore {
    pub fn new() -> Self {
        NoOpStore {}
    }
}

impl CheckpointStore for NoOpStore {
    fn put(
        &self,
        _partition: PartitionIndex,
        _checkpoint: CheckpointId,
        _blob: &[u8],
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn mark_complete(&self, _meta: &CheckpointMeta) -> Result<(), StoreError> {
        Ok(())
    }

    fn latest_complete_meta(&self) -> Result<Option<CheckpointMeta>, StoreError> {
        Ok(None)
    }

    fn latest_complete(
        &self,
        _partition: PartitionIndex,
    ) -> Result<Option<(CheckpointId, Vec<u8>)>, StoreError> {
        Ok(None)
    }

    fn garbage_collect(&self, _older_than: CheckpointId) -> Result<usize, StoreError> {
        Ok(0)
    }
}
