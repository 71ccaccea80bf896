//! Partition workers.
//!
//! Each partition runs one [`PartitionWorker`] on its own task. It
//! owns its [`SessionStateManager`] and sink exclusively and reads a
//! single queue, so records for an entity are applied in the order
//! the dispatcher routed them and no locking is needed on state.
//!
//! Crash Recovery
//! --------------
//!
//! A worker keeps the serialized state of the last checkpoint it knows
//! completed (or of the state it started with) plus a log of every
//! message since. If applying a record panics or the sink fails, the
//! worker throws away its live state, restores that base, and replays
//! the log, re-emitting the replayed records. Downstream therefore sees
//! duplicates but every record is emitted at least once.
//!
//! The log is bounded; once it overflows a crash loses the dropped
//! records' effect on state until the next checkpoint completes.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};

use crate::config::PipelineConfig;
use crate::errors::{panic_message, CheckpointError, PartitionCrash, PipelineError};
use crate::event::Event;
use crate::inputs::Offset;
use crate::metrics::PipelineMetrics;
use crate::outputs::{OutputRecord, Sink};
use crate::partition::{PartitionCount, PartitionIndex};
use crate::recovery::coordinator::{Barrier, BarrierAck};
use crate::recovery::store::with_retry_blocking;
use crate::recovery::{
    CheckpointId, CheckpointMeta, CheckpointStore, PartitionResume, PartitionSnapshot, RetryPolicy,
};
use crate::session::{EntitySnapshot, EntityState, SessionStateManager};
use crate::with_timer;

/// A normalized event on its way to a partition.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) offset: Offset,
    pub(crate) event: Event,
}

pub(crate) enum WorkerMsg {
    Record(Envelope),
    Barrier(Barrier),
    /// No more input; flush and stop.
    Shutdown,
}

enum LogEntry {
    Record(Envelope),
    Barrier(CheckpointId),
}

/// What a partition ended a run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub partition: PartitionIndex,
    /// Final state of every entity the partition owns, ordered by id.
    pub entities: Vec<EntityState>,
    /// Records applied since the partition's state began, including
    /// those restored from a checkpoint.
    pub records_applied: u64,
    pub restarts: u32,
}

/// State the worker falls back to after a crash.
struct Base {
    checkpoint: Option<CheckpointId>,
    /// A serialized [`PartitionSnapshot`]. `None` is the empty state.
    blob: Option<Arc<Vec<u8>>>,
}

pub(crate) struct PartitionWorker {
    partition: PartitionIndex,
    partition_count: PartitionCount,
    session_timeout: chrono::Duration,
    max_session_events: Option<usize>,
    manager: SessionStateManager,
    logical_timestamp: u64,
    sink: Box<dyn Sink>,
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    rx: mpsc::Receiver<WorkerMsg>,
    committed: watch::Receiver<Option<CheckpointId>>,
    replay_log: VecDeque<LogEntry>,
    replay_capacity: usize,
    replay_overflowed: bool,
    base: Base,
    /// Snapshots taken at barriers whose checkpoints haven't completed.
    pending: BTreeMap<CheckpointId, Arc<Vec<u8>>>,
    restarts: u32,
    /// Crashes since the last record applied cleanly.
    consecutive_crashes: u32,
    max_restarts: u32,
    metrics: Arc<PipelineMetrics>,
    labels: Vec<KeyValue>,
}

impl PartitionWorker {
    pub(crate) fn new(
        partition: PartitionIndex,
        config: &PipelineConfig,
        sink: Box<dyn Sink>,
        store: Arc<dyn CheckpointStore>,
        rx: mpsc::Receiver<WorkerMsg>,
        committed: watch::Receiver<Option<CheckpointId>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            partition,
            partition_count: config.partition_count(),
            session_timeout: config.session_timeout(),
            max_session_events: config.max_session_events,
            manager: SessionStateManager::new(config.session_timeout())
                .with_max_session_events(config.max_session_events),
            logical_timestamp: 0,
            sink,
            store,
            retry: RetryPolicy::from_config(config),
            rx,
            committed,
            replay_log: VecDeque::new(),
            replay_capacity: config.replay_log_capacity.max(1),
            replay_overflowed: false,
            base: Base {
                checkpoint: None,
                blob: None,
            },
            pending: BTreeMap::new(),
            restarts: 0,
            consecutive_crashes: 0,
            max_restarts: config.max_partition_restarts,
            metrics,
            labels: PipelineMetrics::partition_labels(partition),
        }
    }

    /// Start from state restored out of checkpoint `from`.
    pub(crate) fn resume(
        mut self,
        from: &CheckpointMeta,
        state: PartitionResume,
    ) -> Result<Self, serde_json::Error> {
        let snapshot = PartitionSnapshot {
            checkpoint_id: from.checkpoint_id,
            partition: self.partition,
            partition_count: self.partition_count,
            input_offset: from.input_offset,
            logical_timestamp: state.logical_timestamp,
            created_at: Utc::now(),
            entities: state.entities,
        };
        self.base = Base {
            checkpoint: Some(from.checkpoint_id),
            blob: Some(Arc::new(snapshot.to_bytes()?)),
        };
        tracing::debug!(
            "{:?} resuming with {} entities",
            self.partition,
            snapshot.entities.len()
        );
        self.logical_timestamp = snapshot.logical_timestamp;
        self.manager = self.restored_manager(snapshot.entities);
        Ok(self)
    }

    /// Process messages until shut down. Spawn inside a span naming
    /// the partition.
    pub(crate) async fn run(mut self) -> Result<WorkerReport, PipelineError> {
        tracing::info!("Worker start");
        let mut commits_open = true;
        loop {
            tokio::select! {
                biased;
                changed = self.committed.changed(), if commits_open => match changed {
                    Ok(()) => {
                        let committed = *self.committed.borrow_and_update();
                        if let Some(checkpoint) = committed {
                            self.on_commit(checkpoint);
                        }
                    }
                    // Coordinator is gone; nothing more will commit.
                    Err(_) => commits_open = false,
                },
                msg = self.rx.recv() => match msg {
                    Some(WorkerMsg::Record(envelope)) => {
                        self.log(LogEntry::Record(envelope.clone()));
                        match self.apply(&envelope).await {
                            Ok(()) => self.consecutive_crashes = 0,
                            Err(crash) => self.handle_crash(crash).await?,
                        }
                    }
                    Some(WorkerMsg::Barrier(barrier)) => self.take_snapshot(barrier),
                    Some(WorkerMsg::Shutdown) | None => break,
                },
            }
        }

        if let Err(err) = self.sink.flush().await {
            tracing::warn!("Unable to flush sink on shutdown: {err}");
        }
        tracing::info!("Worker stop");
        Ok(WorkerReport {
            partition: self.partition,
            entities: self.manager.entity_states().cloned().collect(),
            records_applied: self.logical_timestamp,
            restarts: self.restarts,
        })
    }

    /// Apply one record to state and emit its analytics record.
    async fn apply(&mut self, envelope: &Envelope) -> Result<(), PartitionCrash> {
        let manager = &mut self.manager;
        let event = &envelope.event;
        let record = std::panic::catch_unwind(AssertUnwindSafe(|| manager.process(event)))
            .map_err(|payload| PartitionCrash::Panicked(panic_message(payload)))?;
        self.logical_timestamp += 1;
        self.metrics.record_processed(&self.labels);

        let output = match OutputRecord::encode(&record) {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!("Dropping output for record at {:?}: {err}", envelope.offset);
                self.metrics.record_sink_error(&self.labels);
                return Ok(());
            }
        };
        let sent = with_timer!(
            self.metrics.sink_send_duration,
            self.labels,
            self.sink.send(output).await
        );
        match sent {
            Ok(()) => {
                let latency = (Utc::now() - event.processed_at)
                    .to_std()
                    .map_or(0.0, |latency| latency.as_secs_f64());
                self.metrics.record_emitted(&self.labels, latency);
                Ok(())
            }
            Err(err) if err.is_per_record() => {
                tracing::warn!("Sink refused record at {:?}: {err}", envelope.offset);
                self.metrics.record_sink_error(&self.labels);
                Ok(())
            }
            Err(err) => Err(PartitionCrash::Sink(err)),
        }
    }

    fn log(&mut self, entry: LogEntry) {
        if self.replay_log.len() >= self.replay_capacity {
            self.replay_log.pop_front();
            if !self.replay_overflowed {
                tracing::warn!(
                    "Replay log full at {} entries; a crash before the next checkpoint \
                     completes will lose state",
                    self.replay_capacity
                );
                self.replay_overflowed = true;
            }
        }
        self.replay_log.push_back(entry);
    }

    /// Serialize state at a barrier and write it out in the
    /// background. Processing resumes as soon as serialization is
    /// done.
    fn take_snapshot(&mut self, barrier: Barrier) {
        let checkpoint = barrier.checkpoint;
        let partition = self.partition;
        self.log(LogEntry::Barrier(checkpoint));

        let snapshot = PartitionSnapshot {
            checkpoint_id: checkpoint,
            partition,
            partition_count: barrier.partition_count,
            input_offset: barrier.input_offset,
            logical_timestamp: self.logical_timestamp,
            created_at: Utc::now(),
            entities: self.manager.snapshot(),
        };
        let encoded = with_timer!(self.metrics.snapshot_duration, self.labels, snapshot.to_bytes());
        let blob = match encoded {
            Ok(blob) => Arc::new(blob),
            Err(err) => {
                let result = Err(CheckpointError::SnapshotFailed {
                    partition,
                    checkpoint,
                    reason: err.to_string(),
                });
                // The ack channel has room for every partition.
                let _ = barrier.ack.try_send(BarrierAck { partition, result });
                return;
            }
        };
        tracing::trace!("Snapshot for {checkpoint:?} is {} bytes", blob.len());
        self.pending.insert(checkpoint, blob.clone());

        let store = self.store.clone();
        let retry = self.retry;
        tokio::spawn(async move {
            let result = with_retry_blocking(retry, "writing snapshot", move || {
                store.put(partition, checkpoint, &blob)
            })
            .await;
            if let Err(err) = &result {
                tracing::warn!("Snapshot of {partition:?} for {checkpoint:?} failed: {err}");
            }
            // Closed if the checkpoint already timed out.
            let _ = barrier.ack.send(BarrierAck { partition, result }).await;
        });
    }

    /// A checkpoint completed; it becomes the new crash base.
    fn on_commit(&mut self, checkpoint: CheckpointId) {
        let Some(blob) = self.pending.remove(&checkpoint) else {
            return;
        };
        self.pending.retain(|pending, _| *pending > checkpoint);
        self.base = Base {
            checkpoint: Some(checkpoint),
            blob: Some(blob),
        };

        let barrier_at = self
            .replay_log
            .iter()
            .position(|entry| matches!(entry, LogEntry::Barrier(id) if *id == checkpoint));
        if let Some(at) = barrier_at {
            self.replay_log.drain(..=at);
            self.replay_overflowed = false;
        }
        tracing::debug!(
            "Crash base now {checkpoint:?}; {} log entries to replay",
            self.replay_log.len()
        );
    }

    async fn handle_crash(&mut self, mut crash: PartitionCrash) -> Result<(), PipelineError> {
        loop {
            if self.consecutive_crashes >= self.max_restarts {
                tracing::error!("Giving up on {:?}: {crash}", self.partition);
                return Err(PipelineError::PartitionFailed {
                    partition: self.partition,
                    restarts: self.restarts,
                    source: crash,
                });
            }
            self.restarts += 1;
            self.consecutive_crashes += 1;
            self.metrics.record_restart(&self.labels);
            tracing::error!(
                "Partition crashed ({crash}); restarting from {:?} (attempt {}/{})",
                self.base.checkpoint,
                self.consecutive_crashes,
                self.max_restarts
            );
            match self.recover().await {
                Ok(()) => return Ok(()),
                Err(next) => crash = next,
            }
        }
    }

    fn restored_manager(&self, entities: Vec<EntitySnapshot>) -> SessionStateManager {
        SessionStateManager::restore(self.session_timeout, entities)
            .with_max_session_events(self.max_session_events)
    }

    async fn recover(&mut self) -> Result<(), PartitionCrash> {
        match &self.base.blob {
            Some(blob) => {
                let base = PartitionSnapshot::from_bytes(blob)
                    .map_err(|err| PartitionCrash::Restore(err.to_string()))?;
                self.manager = self.restored_manager(base.entities);
                self.logical_timestamp = base.logical_timestamp;
            }
            None => {
                self.manager = self.restored_manager(Vec::new());
                self.logical_timestamp = 0;
            }
        }
        if self.replay_overflowed {
            tracing::warn!("Replay log overflowed; restored state is missing records");
        }

        let replay: Vec<Envelope> = self
            .replay_log
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::Record(envelope) => Some(envelope.clone()),
                LogEntry::Barrier(_) => None,
            })
            .collect();
        tracing::info!("Replaying {} records", replay.len());
        for envelope in &replay {
            self.apply(envelope).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};

    use super::*;
    use crate::errors::SinkError;
    use crate::recovery::InMemCheckpointStore;
    use crate::session::AnalyticsRecord;

    /// Fails with a disconnect on the listed send attempts (1-based).
    struct FlakySink {
        fail_on: Vec<usize>,
        calls: usize,
        sent: Arc<Mutex<Vec<AnalyticsRecord>>>,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
            self.calls += 1;
            if self.fail_on.contains(&self.calls) {
                return Err(SinkError::Disconnected("flaky".into()));
            }
            self.sent.lock().unwrap().push(record.decode().unwrap());
            Ok(())
        }
    }

    struct Harness {
        tx: mpsc::Sender<WorkerMsg>,
        committed: watch::Sender<Option<CheckpointId>>,
        sent: Arc<Mutex<Vec<AnalyticsRecord>>>,
        store: Arc<InMemCheckpointStore>,
        worker: PartitionWorker,
    }

    fn harness(fail_on: Vec<usize>, max_restarts: u32) -> Harness {
        let config = PipelineConfig {
            parallelism: 1,
            max_partition_restarts: max_restarts,
            store_retry_backoff_ms: 1,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(64);
        let (committed, committed_rx) = watch::channel(None);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(InMemCheckpointStore::new());
        let sink = FlakySink {
            fail_on,
            calls: 0,
            sent: sent.clone(),
        };
        let worker = PartitionWorker::new(
            PartitionIndex(0),
            &config,
            Box::new(sink),
            store.clone(),
            rx,
            committed_rx,
            Arc::new(PipelineMetrics::new()),
        );
        Harness {
            tx,
            committed,
            sent,
            store,
            worker,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn record(offset: u64, entity_id: &str, secs: i64) -> WorkerMsg {
        WorkerMsg::Record(Envelope {
            offset: Offset(offset),
            event: Event {
                event_type: "click".into(),
                entity_id: entity_id.into(),
                timestamp: at(secs),
                processed_at: Utc::now(),
                payload: Default::default(),
            },
        })
    }

    fn barrier(checkpoint: u64, offset: u64) -> (WorkerMsg, mpsc::Receiver<BarrierAck>) {
        let (ack, acks) = mpsc::channel(1);
        let msg = WorkerMsg::Barrier(Barrier {
            checkpoint: CheckpointId(checkpoint),
            input_offset: Offset(offset),
            partition_count: PartitionCount(1),
            ack,
        });
        (msg, acks)
    }

    #[tokio::test]
    async fn snapshot_at_barrier_is_written() {
        let h = harness(vec![], 3);
        let task = tokio::spawn(h.worker.run());

        h.tx.send(record(0, "u1", 0)).await.unwrap();
        h.tx.send(record(1, "u1", 10)).await.unwrap();
        let (msg, mut acks) = barrier(1, 2);
        h.tx.send(msg).await.unwrap();
        let ack = acks.recv().await.unwrap();
        assert_eq!(ack.partition, PartitionIndex(0));
        assert!(ack.result.is_ok());

        // Records after the barrier don't leak into the snapshot.
        h.tx.send(record(2, "u1", 20)).await.unwrap();
        h.tx.send(WorkerMsg::Shutdown).await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.records_applied, 3);
        assert_eq!(report.entities[0].total_event_count, 3);

        assert_eq!(h.store.snapshot_count(), 1);
        h.store
            .mark_complete(&CheckpointMeta {
                checkpoint_id: CheckpointId(1),
                partition_count: PartitionCount(1),
                input_offset: Offset(2),
            })
            .unwrap();
        let (_, blob) = h.store.latest_complete(PartitionIndex(0)).unwrap().unwrap();
        let snapshot = PartitionSnapshot::from_bytes(&blob).unwrap();
        assert_eq!(snapshot.logical_timestamp, 2);
        assert_eq!(snapshot.entities[0].entity.total_event_count, 2);
    }

    #[tokio::test]
    async fn sink_failure_replays_from_start() {
        let h = harness(vec![3], 3);
        let task = tokio::spawn(h.worker.run());

        for (offset, secs) in [0, 10, 20].into_iter().enumerate() {
            h.tx.send(record(offset as u64, "u1", secs)).await.unwrap();
        }
        h.tx.send(WorkerMsg::Shutdown).await.unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.restarts, 1);
        assert_eq!(report.entities[0].total_event_count, 3);
        let sent = h.sent.lock().unwrap();
        // The first two went out again during replay.
        assert_eq!(sent.len(), 5);
        let counts: Vec<u64> = sent.iter().map(|r| r.total_event_count).collect();
        assert_eq!(counts, vec![1, 2, 1, 2, 3]);
    }

    #[tokio::test]
    async fn commit_truncates_replay() {
        let h = harness(vec![3], 3);
        let task = tokio::spawn(h.worker.run());

        h.tx.send(record(0, "u1", 0)).await.unwrap();
        h.tx.send(record(1, "u1", 10)).await.unwrap();
        let (msg, mut acks) = barrier(1, 2);
        h.tx.send(msg).await.unwrap();
        assert!(acks.recv().await.unwrap().result.is_ok());
        h.committed.send_replace(Some(CheckpointId(1)));

        h.tx.send(record(2, "u1", 20)).await.unwrap();
        h.tx.send(WorkerMsg::Shutdown).await.unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.restarts, 1);
        assert_eq!(report.entities[0].total_event_count, 3);
        // Only the record after the committed barrier was replayed.
        let counts: Vec<u64> = h
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.total_event_count)
            .collect();
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn gives_up_after_max_restarts() {
        let h = harness((1..100).collect(), 2);
        let task = tokio::spawn(h.worker.run());

        h.tx.send(record(0, "u1", 0)).await.unwrap();
        // The worker may already be gone.
        let _ = h.tx.send(WorkerMsg::Shutdown).await;
        let found = task.await.unwrap();
        assert!(matches!(
            found,
            Err(PipelineError::PartitionFailed {
                partition: PartitionIndex(0),
                restarts: 2,
                source: PartitionCrash::Sink(SinkError::Disconnected(_)),
            })
        ));
    }

    #[tokio::test]
    async fn resume_restores_state() {
        let h = harness(vec![], 3);
        let meta = CheckpointMeta {
            checkpoint_id: CheckpointId(4),
            partition_count: PartitionCount(1),
            input_offset: Offset(10),
        };
        let state = PartitionResume {
            entities: vec![crate::recovery::test_entity("u1", 7)],
            logical_timestamp: 7,
        };
        let worker = h.worker.resume(&meta, state).unwrap();
        let task = tokio::spawn(worker.run());

        h.tx.send(record(10, "u1", 0)).await.unwrap();
        h.tx.send(WorkerMsg::Shutdown).await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.records_applied, 8);
        assert_eq!(report.entities[0].total_event_count, 8);
    }
}
