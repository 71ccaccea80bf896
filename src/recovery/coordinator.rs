//! Scheduling and completing checkpoints.
//!
//! The dispatcher owns a [`CheckpointCoordinator`] and asks it when
//! the next checkpoint is due. To start one it calls
//! [`CheckpointCoordinator::begin`], sends the returned [`Barrier`]
//! into every partition's input queue right after the last record it
//! routed, and drives the returned [`PendingCheckpoint`] to completion
//! on a separate task so ingestion continues meanwhile. The outcome is
//! handed back through [`CheckpointCoordinator::finish`].
//!
//! At most one checkpoint is in flight, and a new one never starts
//! within the minimum pause after the previous one ended.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::errors::CheckpointError;
use crate::inputs::Offset;
use crate::metrics::PipelineMetrics;
use crate::partition::{PartitionCount, PartitionIndex};

use super::store::with_retry_blocking;
use super::{CheckpointId, CheckpointMeta, CheckpointStore, RetryPolicy};

/// Marker injected in-band into a partition's input.
///
/// Every record routed before it is reflected in the snapshot the
/// partition takes when it reaches the barrier; no record after it is.
#[derive(Debug, Clone)]
pub(crate) struct Barrier {
    pub(crate) checkpoint: CheckpointId,
    pub(crate) input_offset: Offset,
    pub(crate) partition_count: PartitionCount,
    pub(crate) ack: mpsc::Sender<BarrierAck>,
}

/// A partition's answer to a [`Barrier`], sent once its snapshot is
/// durable or failed to be.
#[derive(Debug)]
pub(crate) struct BarrierAck {
    pub(crate) partition: PartitionIndex,
    pub(crate) result: Result<(), CheckpointError>,
}

/// What the dispatcher should do when the timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Due {
    Checkpoint,
    /// Checkpointing is off; remind the operator.
    DegradedWarning,
}

pub(crate) struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    partition_count: PartitionCount,
    interval: Duration,
    timeout: Duration,
    min_pause: Duration,
    retained: usize,
    next_id: CheckpointId,
    /// Newest last.
    completed: VecDeque<CheckpointId>,
    last_started: Instant,
    last_finished: Option<Instant>,
    degraded: bool,
    committed_tx: watch::Sender<Option<CheckpointId>>,
    metrics: Arc<PipelineMetrics>,
}

impl CheckpointCoordinator {
    pub(crate) fn new(
        config: &PipelineConfig,
        store: Arc<dyn CheckpointStore>,
        resumed_from: Option<CheckpointId>,
        next_id: CheckpointId,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (committed_tx, _) = watch::channel(resumed_from);
        Self {
            store,
            retry: RetryPolicy::from_config(config),
            partition_count: config.partition_count(),
            interval: config.checkpoint_interval(),
            timeout: config.checkpoint_timeout(),
            min_pause: config.min_pause_between_checkpoints(),
            retained: config.retained_checkpoints.max(1) as usize,
            next_id,
            completed: resumed_from.into_iter().collect(),
            last_started: Instant::now(),
            last_finished: None,
            degraded: false,
            committed_tx,
            metrics,
        }
    }

    /// Receives the ID of each checkpoint as it completes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<CheckpointId>> {
        self.committed_tx.subscribe()
    }

    pub(crate) fn last_completed(&self) -> Option<CheckpointId> {
        self.completed.back().copied()
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// When the timer should next fire.
    pub(crate) fn next_due(&self) -> Instant {
        let by_interval = self.last_started + self.interval;
        match self.last_finished {
            Some(finished) => by_interval.max(finished + self.min_pause),
            None => by_interval,
        }
    }

    /// Earliest a final checkpoint may start.
    pub(crate) fn final_not_before(&self) -> Instant {
        self.last_finished
            .map_or_else(Instant::now, |finished| finished + self.min_pause)
    }

    /// Call when the timer fires, with no checkpoint in flight.
    pub(crate) fn tick(&mut self) -> Due {
        if self.degraded {
            self.last_started = Instant::now();
            tracing::warn!(
                "Checkpoint store unavailable; running without checkpoints. \
                 State since checkpoint {:?} will be lost on failure",
                self.last_completed()
            );
            Due::DegradedWarning
        } else {
            Due::Checkpoint
        }
    }

    /// Start a checkpoint at `input_offset`.
    ///
    /// The barrier must reach every partition, after which the pending
    /// checkpoint can be awaited.
    pub(crate) fn begin(&mut self, input_offset: Offset) -> (Barrier, PendingCheckpoint) {
        let checkpoint = self.next_id;
        self.next_id = checkpoint.next();
        self.last_started = Instant::now();

        // Which checkpoints survive GC once this one completes.
        let keep_previous = self.retained - 1;
        let gc_older_than = if keep_previous == 0 {
            checkpoint
        } else {
            self.completed
                .iter()
                .rev()
                .take(keep_previous)
                .last()
                .copied()
                .unwrap_or(checkpoint)
        };

        tracing::debug!("Starting checkpoint {checkpoint:?} at input offset {input_offset:?}");
        let (ack, acks) = mpsc::channel(self.partition_count.0.max(1));
        let barrier = Barrier {
            checkpoint,
            input_offset,
            partition_count: self.partition_count,
            ack,
        };
        let pending = PendingCheckpoint {
            meta: CheckpointMeta {
                checkpoint_id: checkpoint,
                partition_count: self.partition_count,
                input_offset,
            },
            acks,
            store: self.store.clone(),
            retry: self.retry,
            timeout: self.timeout,
            gc_older_than,
        };
        (barrier, pending)
    }

    /// Record how an attempt ended.
    pub(crate) fn finish(&mut self, outcome: Result<CheckpointMeta, CheckpointError>) {
        self.last_finished = Some(Instant::now());
        match outcome {
            Ok(meta) => {
                let id = meta.checkpoint_id;
                tracing::info!(
                    "Checkpoint {id:?} complete at input offset {:?}",
                    meta.input_offset
                );
                self.completed.push_back(id);
                while self.completed.len() > self.retained {
                    self.completed.pop_front();
                }
                self.committed_tx.send_replace(Some(id));
                self.metrics.record_checkpoint_completed(id);
            }
            Err(err @ CheckpointError::StoreUnavailable { .. }) => {
                tracing::error!(
                    "Disabling checkpoints: {err}; the pipeline keeps running without fault tolerance"
                );
                self.degraded = true;
                self.metrics.record_checkpoint_failed();
                self.metrics.set_degraded();
            }
            Err(err) => {
                tracing::warn!(
                    "Discarding checkpoint: {err}; checkpoint {:?} remains the recovery point",
                    self.last_completed()
                );
                self.metrics.record_checkpoint_failed();
            }
        }
    }
}

/// A started checkpoint waiting for every partition.
pub(crate) struct PendingCheckpoint {
    meta: CheckpointMeta,
    acks: mpsc::Receiver<BarrierAck>,
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    timeout: Duration,
    gc_older_than: CheckpointId,
}

impl PendingCheckpoint {
    pub(crate) fn id(&self) -> CheckpointId {
        self.meta.checkpoint_id
    }

    /// Wait for every partition to acknowledge, then mark the
    /// checkpoint complete and collect garbage.
    ///
    /// Nothing is marked complete if any partition fails or the
    /// timeout passes first.
    pub(crate) async fn complete(mut self) -> Result<CheckpointMeta, CheckpointError> {
        let checkpoint = self.meta.checkpoint_id;
        let expected = self.meta.partition_count.0;
        let mut acked = BTreeSet::new();

        let acks = &mut self.acks;
        let gathered = tokio::time::timeout(self.timeout, async {
            while acked.len() < expected {
                match acks.recv().await {
                    Some(BarrierAck {
                        partition,
                        result: Ok(()),
                    }) => {
                        acked.insert(partition);
                    }
                    Some(BarrierAck {
                        result: Err(err), ..
                    }) => return Err(err),
                    None => return Err(CheckpointError::Aborted(checkpoint)),
                }
            }
            Ok(())
        })
        .await;
        match gathered {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                return Err(CheckpointError::Timeout {
                    checkpoint,
                    timeout: self.timeout,
                    acked: acked.len(),
                    expected,
                })
            }
        }

        let store = self.store.clone();
        let meta = self.meta.clone();
        with_retry_blocking(self.retry, "marking checkpoint complete", move || {
            store.mark_complete(&meta)
        })
        .await?;

        let store = self.store.clone();
        let older_than = self.gc_older_than;
        match with_retry_blocking(self.retry, "checkpoint garbage collection", move || {
            store.garbage_collect(older_than)
        })
        .await
        {
            Ok(removed) => {
                tracing::debug!("Removed {removed} snapshots older than {older_than:?}")
            }
            // Leftover snapshots only cost space.
            Err(err) => tracing::warn!("Skipping garbage collection: {err}"),
        }

        Ok(self.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::recovery::InMemCheckpointStore;

    fn config(parallelism: usize, timeout_ms: u64) -> PipelineConfig {
        PipelineConfig {
            parallelism,
            checkpoint_timeout_ms: timeout_ms,
            min_pause_between_checkpoints_ms: 10,
            store_retry_attempts: 2,
            store_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn coordinator(
        config: &PipelineConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> CheckpointCoordinator {
        CheckpointCoordinator::new(
            config,
            store,
            None,
            CheckpointId::default(),
            Arc::new(PipelineMetrics::new()),
        )
    }

    /// Write a partition's snapshot and ack like a worker does.
    async fn ack(store: &Arc<InMemCheckpointStore>, barrier: &Barrier, partition: usize) {
        let partition = PartitionIndex(partition);
        store
            .put(partition, barrier.checkpoint, b"state")
            .unwrap();
        barrier
            .ack
            .send(BarrierAck {
                partition,
                result: Ok(()),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completes_when_all_partitions_ack() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = config(2, 1_000);
        let mut coord = coordinator(&config, store.clone());
        let mut committed = coord.subscribe();

        let (barrier, pending) = coord.begin(Offset(12));
        ack(&store, &barrier, 0).await;
        ack(&store, &barrier, 1).await;
        drop(barrier);

        let outcome = pending.complete().await;
        assert_eq!(outcome.as_ref().unwrap().input_offset, Offset(12));
        coord.finish(outcome);

        assert_eq!(coord.last_completed(), Some(CheckpointId(1)));
        assert!(committed.has_changed().unwrap());
        assert_eq!(*committed.borrow_and_update(), Some(CheckpointId(1)));
        assert_eq!(
            store.latest_complete_meta().unwrap().unwrap().checkpoint_id,
            CheckpointId(1)
        );
    }

    #[tokio::test]
    async fn timeout_discards_checkpoint() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = config(2, 50);
        let mut coord = coordinator(&config, store.clone());

        // First checkpoint completes.
        let (barrier, pending) = coord.begin(Offset(5));
        ack(&store, &barrier, 0).await;
        ack(&store, &barrier, 1).await;
        coord.finish(pending.complete().await);

        // Second one: partition 1 stalls past the timeout.
        let (barrier, pending) = coord.begin(Offset(9));
        ack(&store, &barrier, 0).await;
        let outcome = pending.complete().await;
        assert!(matches!(
            outcome,
            Err(CheckpointError::Timeout {
                acked: 1,
                expected: 2,
                ..
            })
        ));
        coord.finish(outcome);

        assert!(!coord.is_degraded());
        assert_eq!(coord.last_completed(), Some(CheckpointId(1)));
        let meta = store.latest_complete_meta().unwrap().unwrap();
        assert_eq!(meta.checkpoint_id, CheckpointId(1));
        assert_eq!(meta.input_offset, Offset(5));
    }

    #[tokio::test]
    async fn failed_partition_write_discards_checkpoint() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = config(2, 1_000);
        let mut coord = coordinator(&config, store.clone());

        let (barrier, pending) = coord.begin(Offset(3));
        ack(&store, &barrier, 0).await;
        barrier
            .ack
            .send(BarrierAck {
                partition: PartitionIndex(1),
                result: Err(CheckpointError::SnapshotFailed {
                    partition: PartitionIndex(1),
                    checkpoint: barrier.checkpoint,
                    reason: "encode".to_string(),
                }),
            })
            .await
            .unwrap();

        let outcome = pending.complete().await;
        assert!(matches!(outcome, Err(CheckpointError::SnapshotFailed { .. })));
        coord.finish(outcome);
        assert_eq!(store.latest_complete_meta().unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_barriers_abort() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = config(2, 1_000);
        let mut coord = coordinator(&config, store);

        let (barrier, pending) = coord.begin(Offset(0));
        drop(barrier);
        assert!(matches!(
            pending.complete().await,
            Err(CheckpointError::Aborted(CheckpointId(1)))
        ));
    }

    #[tokio::test]
    async fn store_outage_degrades() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = config(1, 1_000);
        let mut coord = coordinator(&config, store);

        coord.finish(Err(CheckpointError::StoreUnavailable {
            attempts: 2,
            source: StoreError::Unavailable("disk gone".to_string()),
        }));
        assert!(coord.is_degraded());
        assert_eq!(coord.tick(), Due::DegradedWarning);
    }

    #[tokio::test]
    async fn rejected_mark_complete_discards_only_that_attempt() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = config(2, 1_000);
        let mut coord = coordinator(&config, store.clone());

        // Partition 1 acks without its snapshot being in the store.
        let (barrier, pending) = coord.begin(Offset(4));
        ack(&store, &barrier, 0).await;
        barrier
            .ack
            .send(BarrierAck {
                partition: PartitionIndex(1),
                result: Ok(()),
            })
            .await
            .unwrap();

        let outcome = pending.complete().await;
        assert!(matches!(
            outcome,
            Err(CheckpointError::Store(StoreError::Incomplete { found: 1, expected: 2, .. }))
        ));
        coord.finish(outcome);

        assert!(!coord.is_degraded());
        assert_eq!(coord.tick(), Due::Checkpoint);
        assert_eq!(store.latest_complete_meta().unwrap(), None);

        // The next attempt goes through.
        let (barrier, pending) = coord.begin(Offset(8));
        ack(&store, &barrier, 0).await;
        ack(&store, &barrier, 1).await;
        coord.finish(pending.complete().await);
        assert_eq!(coord.last_completed(), Some(CheckpointId(2)));
    }

    #[tokio::test]
    async fn ids_increase_and_gc_keeps_retained() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = PipelineConfig {
            retained_checkpoints: 2,
            ..config(1, 1_000)
        };
        let mut coord = coordinator(&config, store.clone());

        for round in 0..4 {
            let (barrier, pending) = coord.begin(Offset(round));
            assert_eq!(pending.id(), CheckpointId(round + 1));
            ack(&store, &barrier, 0).await;
            coord.finish(pending.complete().await);
        }

        assert_eq!(coord.last_completed(), Some(CheckpointId(4)));
        // Checkpoints 3 and 4 survive.
        assert_eq!(store.snapshot_count(), 2);
    }

    #[tokio::test]
    async fn schedule_honors_min_pause() {
        let store = Arc::new(InMemCheckpointStore::new());
        let config = PipelineConfig {
            checkpoint_interval_ms: 5,
            min_pause_between_checkpoints_ms: 200,
            ..config(1, 1_000)
        };
        let mut coord = coordinator(&config, store);

        let (_barrier, _pending) = coord.begin(Offset(0));
        coord.finish(Err(CheckpointError::Aborted(CheckpointId(1))));
        let pause_end = coord.final_not_before();
        assert_eq!(coord.next_due(), pause_end);
        assert!(coord.next_due() >= Instant::now() + Duration::from_millis(150));
    }
}
