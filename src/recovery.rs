//! Checkpointing and recovery.
//!
//! Periodically every partition snapshots its whole state at a
//! barrier injected at the same input offset, then writes it to a
//! [`CheckpointStore`]. Once every partition has written, the
//! checkpoint is marked complete and becomes the point a new run
//! resumes from.
//!
//! Only complete checkpoints are ever read back. A snapshot written
//! for an attempt that never completed is ignored and later garbage
//! collected.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::errors::RecoveryError;
use crate::inputs::Offset;
use crate::partition::{PartitionCount, PartitionIndex, Partitioner};
use crate::session::EntitySnapshot;

pub mod coordinator;
pub mod store;

pub use self::store::in_mem::InMemCheckpointStore;
pub use self::store::noop::NoOpStore;
pub use self::store::sqlite::SqliteCheckpointStore;
pub use self::store::{CheckpointStore, RetryPolicy};

/// Incrementing ID of a checkpoint attempt.
///
/// Attempts that fail still use up an ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for CheckpointId {
    /// The first checkpoint is 1 so 0 never appears in a store.
    fn default() -> Self {
        CheckpointId(1)
    }
}

/// Written to the store when a checkpoint completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub checkpoint_id: CheckpointId,
    /// How many partition snapshots make up this checkpoint.
    pub partition_count: PartitionCount,
    /// Offset of the first record not reflected in the checkpoint.
    pub input_offset: Offset,
}

/// One partition's state at a checkpoint barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub checkpoint_id: CheckpointId,
    pub partition: PartitionIndex,
    pub partition_count: PartitionCount,
    pub input_offset: Offset,
    /// Records this partition had applied when the barrier arrived.
    pub logical_timestamp: u64,
    pub created_at: DateTime<Utc>,
    pub entities: Vec<EntitySnapshot>,
}

impl PartitionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// State a single partition starts a run with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionResume {
    pub entities: Vec<EntitySnapshot>,
    pub logical_timestamp: u64,
}

/// Where a run picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    /// The checkpoint restored from, if any.
    pub from: Option<CheckpointMeta>,
    pub input_offset: Offset,
    pub next_checkpoint: CheckpointId,
    /// Indexed by the current run's partitions.
    pub partitions: Vec<PartitionResume>,
}

impl ResumeState {
    fn fresh(count: PartitionCount) -> Self {
        Self {
            from: None,
            input_offset: Offset::default(),
            next_checkpoint: CheckpointId::default(),
            partitions: vec![PartitionResume::default(); count.0],
        }
    }
}

/// Read the latest complete checkpoint and lay its state out over
/// `partitioner`'s partitions.
///
/// Entities are routed again by id, so this also works when the
/// checkpoint was taken with a different partition count.
#[instrument(name = "load_resume_state", skip_all)]
pub fn load_resume_state(
    store: &dyn CheckpointStore,
    partitioner: &Partitioner,
) -> Result<ResumeState, RecoveryError> {
    let count = partitioner.count();
    let Some(meta) = store.latest_complete_meta()? else {
        tracing::info!("No complete checkpoint found; starting from the beginning");
        return Ok(ResumeState::fresh(count));
    };

    let rescaled = meta.partition_count != count;
    if rescaled {
        tracing::info!(
            "Checkpoint {:?} has {:?} but running with {count:?}; redistributing state",
            meta.checkpoint_id,
            meta.partition_count
        );
    }

    let mut partitions = vec![PartitionResume::default(); count.0];
    for old_part in meta.partition_count.iter() {
        let (found, blob) =
            store
                .latest_complete(old_part)?
                .ok_or(RecoveryError::MissingPartition {
                    checkpoint: meta.checkpoint_id,
                    partition: old_part,
                })?;
        if found != meta.checkpoint_id {
            return Err(RecoveryError::Inconsistent {
                partition: old_part,
                expected: meta.checkpoint_id,
                found,
            });
        }
        let snapshot = PartitionSnapshot::from_bytes(&blob)?;
        if !rescaled {
            partitions[old_part.0].logical_timestamp = snapshot.logical_timestamp;
        }
        for entity in snapshot.entities {
            let PartitionIndex(to) = partitioner.partition(&entity.entity.entity_id);
            partitions[to].entities.push(entity);
        }
    }
    // Keep each partition's entities in id order like a live manager.
    for part in partitions.iter_mut() {
        part.entities
            .sort_by(|a, b| a.entity.entity_id.cmp(&b.entity.entity_id));
    }

    tracing::info!(
        "Resuming from checkpoint {:?} at input offset {:?}",
        meta.checkpoint_id,
        meta.input_offset
    );
    Ok(ResumeState {
        input_offset: meta.input_offset,
        next_checkpoint: meta.checkpoint_id.next(),
        from: Some(meta),
        partitions,
    })
}

/// Exponential backoff with jitter for the `attempt`th retry.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_ms = fastrand::u64(0..=(base.as_millis() as u64 / 2));
    exp + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
pub(crate) fn test_entity(entity_id: &str, total: u64) -> EntitySnapshot {
    use crate::session::EntityState;
    use chrono::TimeZone;

    EntitySnapshot {
        entity: EntityState {
            entity_id: entity_id.to_string(),
            total_event_count: total,
            last_activity: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            event_type_histogram: Default::default(),
            session_count: 1,
        },
        session: None,
    }
}

#[cfg(test)]
fn write_checkpoint(
    store: &dyn CheckpointStore,
    id: CheckpointId,
    count: PartitionCount,
    offset: Offset,
    entities: &[(&str, u64)],
) {
    let partitioner = Partitioner::new(count);
    for part in count.iter() {
        let snapshot = PartitionSnapshot {
            checkpoint_id: id,
            partition: part,
            partition_count: count,
            input_offset: offset,
            logical_timestamp: 10,
            created_at: Utc::now(),
            entities: entities
                .iter()
                .filter(|(entity_id, _)| partitioner.partition(entity_id) == part)
                .map(|(entity_id, total)| test_entity(entity_id, *total))
                .collect(),
        };
        store.put(part, id, &snapshot.to_bytes().unwrap()).unwrap();
    }
    store
        .mark_complete(&CheckpointMeta {
            checkpoint_id: id,
            partition_count: count,
            input_offset: offset,
        })
        .unwrap();
}

#[test]
fn resume_from_empty() {
    let store = InMemCheckpointStore::new();
    let found = load_resume_state(&store, &Partitioner::new(PartitionCount(2))).unwrap();
    assert_eq!(found, ResumeState::fresh(PartitionCount(2)));
    assert_eq!(found.next_checkpoint, CheckpointId(1));
}

#[test]
fn resume_from_latest_complete() {
    let store = InMemCheckpointStore::new();
    let count = PartitionCount(2);
    write_checkpoint(&store, CheckpointId(1), count, Offset(5), &[("a", 1)]);
    write_checkpoint(&store, CheckpointId(2), count, Offset(9), &[("a", 2), ("b", 1)]);
    // An attempt that never completed.
    store.put(PartitionIndex(0), CheckpointId(3), b"junk").unwrap();

    let found = load_resume_state(&store, &Partitioner::new(count)).unwrap();
    assert_eq!(found.input_offset, Offset(9));
    assert_eq!(found.next_checkpoint, CheckpointId(3));
    let totals: Vec<_> = found
        .partitions
        .iter()
        .flat_map(|part| part.entities.iter())
        .map(|snap| (snap.entity.entity_id.as_str(), snap.entity.total_event_count))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(totals, vec![("a", 2), ("b", 1)]);
    assert!(found.partitions.iter().all(|part| part.logical_timestamp == 10));
}

#[test]
fn resume_redistributes_on_rescale() {
    let store = InMemCheckpointStore::new();
    let ids: Vec<String> = (0..50).map(|i| format!("user-{i}")).collect();
    let entities: Vec<(&str, u64)> = ids.iter().map(|id| (id.as_str(), 3)).collect();
    write_checkpoint(&store, CheckpointId(4), PartitionCount(3), Offset(100), &entities);

    let partitioner = Partitioner::new(PartitionCount(5));
    let found = load_resume_state(&store, &partitioner).unwrap();

    assert_eq!(found.partitions.len(), 5);
    let mut restored = 0;
    for (index, part) in found.partitions.iter().enumerate() {
        for snap in &part.entities {
            assert_eq!(
                partitioner.partition(&snap.entity.entity_id),
                PartitionIndex(index)
            );
            restored += 1;
        }
        assert_eq!(part.logical_timestamp, 0);
    }
    assert_eq!(restored, 50);
}

#[test]
fn resume_fails_on_missing_partition() {
    let store = InMemCheckpointStore::new();
    // Bypass the completeness check the store does on commit.
    store.force_complete(CheckpointMeta {
        checkpoint_id: CheckpointId(1),
        partition_count: PartitionCount(2),
        input_offset: Offset(0),
    });

    let found = load_resume_state(&store, &Partitioner::new(PartitionCount(2)));
    assert!(matches!(found, Err(RecoveryError::MissingPartition { .. })));
}

#[test]
fn backoff_grows() {
    let base = Duration::from_millis(100);
    assert!(backoff_delay(base, 1) >= base);
    assert!(backoff_delay(base, 1) <= base + base / 2);
    assert!(backoff_delay(base, 3) >= base * 4);
}

#[test]
fn checkpoint_id_serde_shape() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &CheckpointId(7),
        &[
            Token::NewtypeStruct {
                name: "CheckpointId",
            },
            Token::U64(7),
        ],
    );
}
