//! Running a pipeline.
//!
//! A [`Pipeline`] is started once. Startup restores state from the
//! checkpoint store, seeks the source, and spawns one
//! [`crate::worker::PartitionWorker`] task per partition plus a single
//! dispatcher task.
//!
//! The dispatcher reads the source in order, runs each record through
//! the ingest chain, and routes the resulting event to its entity's
//! partition over a bounded queue. When a partition's queue is full
//! its input is held back in the dispatcher, so only that partition
//! waits; the others keep receiving records. Reading the source pauses
//! only once some partition has more than
//! [`PipelineConfig::partition_backlog_limit`] records held back. The
//! dispatcher also owns the
//! [`crate::recovery::coordinator::CheckpointCoordinator`] and injects
//! its barriers into every partition's input between two records, so
//! each checkpoint corresponds to one exact input offset.
//!
//! When the source ends or [`PipelineHandle::shutdown`] is called the
//! dispatcher waits for any in-flight checkpoint, takes a final one,
//! and then stops the workers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{instrument, Instrument};

use crate::config::PipelineConfig;
use crate::errors::{prepend_tname, CheckpointError, PipelineError};
use crate::ingest::{ingest_chain, IngestChain, Stage, Verdict};
use crate::inputs::{Offset, Source, SourceRecord};
use crate::metrics::{ensure_metrics_initialized, PipelineMetrics, StatsSnapshot};
use crate::outputs::SinkBuilder;
use crate::partition::{PartitionIndex, Partitioner};
use crate::recovery::coordinator::{CheckpointCoordinator, Due};
use crate::recovery::{
    backoff_delay, load_resume_state, CheckpointId, CheckpointMeta, CheckpointStore, NoOpStore,
};
use crate::session::EntityState;
use crate::webserver::run_webserver;
use crate::worker::{Envelope, PartitionWorker, WorkerMsg, WorkerReport};

/// Everything needed to run: configuration, where records come from,
/// where analytics records go, and where checkpoints are kept.
pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn Source>,
    sinks: Box<dyn SinkBuilder>,
    store: Arc<dyn CheckpointStore>,
}

impl Pipeline {
    /// Checkpoints go nowhere until [`Pipeline::with_store`] is used.
    pub fn new(
        config: PipelineConfig,
        source: impl Source + 'static,
        sinks: impl SinkBuilder + 'static,
    ) -> Self {
        Self {
            config,
            source: Box::new(source),
            sinks: Box::new(sinks),
            store: Arc::new(NoOpStore::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    /// Restore, then start processing in the background.
    ///
    /// Fails without processing anything if the configuration is
    /// invalid, the latest checkpoint can't be restored, the source
    /// can't seek to its offset, or a sink can't be built.
    #[instrument(name = "pipeline_start", skip_all)]
    pub async fn start(self) -> Result<PipelineHandle, PipelineError> {
        let Self {
            config,
            mut source,
            sinks,
            store,
        } = self;
        config.validate()?;
        let count = config.partition_count();
        let partitioner = Partitioner::new(count);
        tracing::info!("Starting pipeline with {count:?}");

        let resume = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || load_resume_state(store.as_ref(), &partitioner))
                .await
                .map_err(|err| {
                    PipelineError::Invariant(prepend_tname(format!("recovery task failed: {err}")))
                })??
        };
        source.seek(resume.input_offset).await?;

        let mut built = Vec::with_capacity(count.0);
        for partition in count.iter() {
            let sink = sinks
                .build(partition)
                .map_err(|source| PipelineError::Sink { partition, source })?;
            built.push(sink);
        }

        if config.api_port.is_some() {
            ensure_metrics_initialized();
        }
        let metrics = Arc::new(PipelineMetrics::new());
        let resumed_from = resume.from.as_ref().map(|meta| meta.checkpoint_id);
        if let Some(checkpoint) = resumed_from {
            metrics.set_last_checkpoint(checkpoint);
        }

        let coordinator = CheckpointCoordinator::new(
            &config,
            store.clone(),
            resumed_from,
            resume.next_checkpoint,
            metrics.clone(),
        );

        let mut lanes = Vec::with_capacity(count.0);
        let mut workers = Vec::with_capacity(count.0);
        for ((partition, sink), state) in count.iter().zip(built).zip(resume.partitions) {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            let mut worker = PartitionWorker::new(
                partition,
                &config,
                sink,
                store.clone(),
                rx,
                coordinator.subscribe(),
                metrics.clone(),
            );
            if let Some(from) = &resume.from {
                worker = worker.resume(from, state).map_err(|err| {
                    PipelineError::Invariant(format!(
                        "can't encode restored state for {partition:?}: {err}"
                    ))
                })?;
            }
            let span = tracing::info_span!("partition_worker", partition = partition.0);
            workers.push(tokio::spawn(worker.run().instrument(span)));
            lanes.push(Lane::new(partition, tx));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Dropped when the dispatcher exits, which stops the API.
        let (stopped_tx, mut stopped_rx) = watch::channel(());
        if let Some(port) = config.api_port {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let stopped = async move {
                    let _ = stopped_rx.changed().await;
                };
                if let Err(err) = run_webserver(port, metrics, stopped).await {
                    tracing::error!("Status API stopped: {err}");
                }
            });
        }

        let dispatcher = Dispatcher {
            source,
            chain: ingest_chain(&config),
            partitioner,
            lanes,
            backlog_limit: config.partition_backlog_limit,
            coordinator,
            metrics: metrics.clone(),
            next_offset: resume.input_offset,
            source_backoff: config.store_retry_backoff(),
        };
        let task = tokio::spawn(
            async move {
                let report = dispatcher.run(shutdown_rx, workers).await;
                drop(stopped_tx);
                report
            }
            .instrument(tracing::info_span!("dispatcher")),
        );

        Ok(PipelineHandle {
            shutdown: shutdown_tx,
            task,
            metrics,
        })
    }

    /// Run until the source is exhausted.
    pub async fn run(self) -> Result<RunReport, PipelineError> {
        self.start().await?.join().await
    }
}

/// Controls a started pipeline.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<RunReport, PipelineError>>,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineHandle {
    /// Ask the pipeline to stop reading input. It still takes a final
    /// checkpoint; use [`PipelineHandle::join`] to wait for it.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn status(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait for the pipeline to stop.
    pub async fn join(self) -> Result<RunReport, PipelineError> {
        let Self { shutdown, task, .. } = self;
        let report = task.await.map_err(|err| {
            PipelineError::Invariant(prepend_tname(format!("dispatcher task failed: {err}")))
        })?;
        drop(shutdown);
        report
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: StatsSnapshot,
    pub last_checkpoint: Option<CheckpointId>,
    /// Whether checkpointing was turned off by a store outage.
    pub degraded: bool,
    /// Ordered by partition.
    pub partitions: Vec<WorkerReport>,
}

impl RunReport {
    pub fn entity(&self, entity_id: &str) -> Option<&EntityState> {
        self.partitions
            .iter()
            .flat_map(|part| part.entities.iter())
            .find(|entity| entity.entity_id == entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.partitions.iter().flat_map(|part| part.entities.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Requested,
    Exhausted,
    /// A worker stopped early; its error surfaces when joined.
    WorkerGone,
}

type InFlight = (CheckpointId, JoinHandle<Result<CheckpointMeta, CheckpointError>>);

type Reserve = Pin<Box<dyn Future<Output = Result<OwnedPermit<WorkerMsg>, SendError<()>>> + Send>>;

/// The worker's input queue is gone.
#[derive(Debug)]
struct LaneClosed(PartitionIndex);

/// The dispatcher's end of one partition's input.
///
/// Messages go straight onto the worker's bounded queue while it has
/// room. Once it is full they wait in `backlog`, in order, so a slow
/// partition never holds up the others.
struct Lane {
    partition: PartitionIndex,
    queue: mpsc::Sender<WorkerMsg>,
    backlog: VecDeque<WorkerMsg>,
    /// Waiting for room on `queue`; only set while `backlog` is not
    /// empty.
    reserving: Option<Reserve>,
}

impl Lane {
    fn new(partition: PartitionIndex, queue: mpsc::Sender<WorkerMsg>) -> Self {
        Self {
            partition,
            queue,
            backlog: VecDeque::new(),
            reserving: None,
        }
    }

    fn push(&mut self, msg: WorkerMsg) -> Result<(), LaneClosed> {
        if !self.backlog.is_empty() {
            self.backlog.push_back(msg);
            return Ok(());
        }
        match self.queue.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                tracing::trace!("{:?} queue full; holding input back", self.partition);
                self.backlog.push_back(msg);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(LaneClosed(self.partition)),
        }
    }

    /// Move held back messages onto the queue as room frees up.
    ///
    /// Ready once at least one message moved.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), LaneClosed>> {
        let mut moved = false;
        while !self.backlog.is_empty() {
            let reserving = self
                .reserving
                .get_or_insert_with(|| Box::pin(self.queue.clone().reserve_owned()) as Reserve);
            match reserving.as_mut().poll(cx) {
                Poll::Pending => break,
                Poll::Ready(reserved) => {
                    self.reserving = None;
                    let permit = reserved.map_err(|_| LaneClosed(self.partition))?;
                    if let Some(msg) = self.backlog.pop_front() {
                        permit.send(msg);
                        moved = true;
                    }
                }
            }
        }
        if moved {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    /// Hand over everything held back, waiting as long as it takes.
    async fn flush(&mut self) -> Result<(), LaneClosed> {
        self.reserving = None;
        while let Some(msg) = self.backlog.pop_front() {
            if self.queue.send(msg).await.is_err() {
                return Err(LaneClosed(self.partition));
            }
        }
        Ok(())
    }
}

/// Ready once any lane moved part of its backlog. Pends forever if
/// nothing is held back.
async fn drain_lanes(lanes: &mut [Lane]) -> Result<(), LaneClosed> {
    std::future::poll_fn(|cx| {
        let mut progressed = false;
        for lane in lanes.iter_mut() {
            match lane.poll_drain(cx) {
                Poll::Ready(Ok(())) => progressed = true,
                Poll::Ready(Err(closed)) => return Poll::Ready(Err(closed)),
                Poll::Pending => {}
            }
        }
        if progressed {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    })
    .await
}

struct Dispatcher {
    source: Box<dyn Source>,
    chain: IngestChain,
    partitioner: Partitioner,
    lanes: Vec<Lane>,
    backlog_limit: usize,
    coordinator: CheckpointCoordinator,
    metrics: Arc<PipelineMetrics>,
    /// Offset of the next record the source will return.
    next_offset: Offset,
    source_backoff: Duration,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        workers: Vec<JoinHandle<Result<WorkerReport, PipelineError>>>,
    ) -> Result<RunReport, PipelineError> {
        tracing::info!("Dispatcher start at input offset {:?}", self.next_offset);
        let mut in_flight: Option<InFlight> = None;
        let mut shutdown_open = true;
        let mut source_failures = 0;

        let stop = loop {
            let reading = !self.over_backlog_limit();
            let draining = self.has_backlog();
            tokio::select! {
                biased;
                changed = shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            tracing::info!("Shutdown requested");
                            break Stop::Requested;
                        }
                        Ok(()) => {}
                        // Handle dropped; keep running until the source ends.
                        Err(_) => shutdown_open = false,
                    }
                }
                outcome = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                    self.coordinator.finish(outcome);
                }
                drained = drain_lanes(&mut self.lanes), if draining => {
                    if let Err(LaneClosed(partition)) = drained {
                        tracing::warn!("Worker for {partition:?} stopped");
                        break Stop::WorkerGone;
                    }
                }
                _ = tokio::time::sleep_until(self.coordinator.next_due()), if in_flight.is_none() => {
                    match self.coordinator.tick() {
                        Due::DegradedWarning => {}
                        Due::Checkpoint => match self.start_checkpoint() {
                            Some(started) => in_flight = Some(started),
                            None => break Stop::WorkerGone,
                        },
                    }
                }
                next = self.source.next(), if reading => match next {
                    Ok(Some(record)) => {
                        source_failures = 0;
                        if !self.route(record) {
                            break Stop::WorkerGone;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Source exhausted at input offset {:?}", self.next_offset);
                        break Stop::Exhausted;
                    }
                    Err(err) => {
                        source_failures += 1;
                        let delay = backoff_delay(self.source_backoff, source_failures.min(8));
                        tracing::warn!("Unable to read source: {err}; retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        };

        let mut gone = stop == Stop::WorkerGone;
        if !gone {
            gone = !self.settle(&mut in_flight).await;
        }
        if !gone && !self.coordinator.is_degraded() {
            tokio::time::sleep_until(self.coordinator.final_not_before()).await;
            tracing::info!("Taking final checkpoint");
            in_flight = self.start_checkpoint();
            gone = in_flight.is_none() || !self.settle(&mut in_flight).await;
        }
        if gone {
            // Held back barriers would keep the checkpoint waiting.
            for lane in &mut self.lanes {
                lane.reserving = None;
                lane.backlog.clear();
            }
        }
        if in_flight.is_some() {
            let outcome = join_in_flight(&mut in_flight).await;
            self.coordinator.finish(outcome);
        }

        for lane in &mut self.lanes {
            // Fails only if the worker already stopped.
            if lane.flush().await.is_ok() {
                let _ = lane.queue.send(WorkerMsg::Shutdown).await;
            }
        }
        self.lanes.clear();

        let mut partitions = Vec::with_capacity(workers.len());
        let mut failure = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(report)) => partitions.push(report),
                Ok(Err(err)) => {
                    tracing::error!("{err}");
                    failure.get_or_insert(err);
                }
                Err(err) => {
                    let err = PipelineError::Invariant(prepend_tname(format!(
                        "worker task failed: {err}"
                    )));
                    tracing::error!("{err}");
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        tracing::info!("Dispatcher stop ({stop:?})");
        let stats = self.metrics.snapshot();
        Ok(RunReport {
            last_checkpoint: self.coordinator.last_completed(),
            degraded: self.coordinator.is_degraded(),
            stats,
            partitions,
        })
    }

    fn has_backlog(&self) -> bool {
        self.lanes.iter().any(|lane| !lane.backlog.is_empty())
    }

    fn over_backlog_limit(&self) -> bool {
        self.lanes
            .iter()
            .any(|lane| lane.backlog.len() >= self.backlog_limit)
    }

    /// Keep moving held back input until the in-flight checkpoint, if
    /// any, has finished.
    ///
    /// Returns `false` if a worker is gone.
    async fn settle(&mut self, in_flight: &mut Option<InFlight>) -> bool {
        while in_flight.is_some() {
            let draining = self.has_backlog();
            tokio::select! {
                outcome = join_in_flight(in_flight) => {
                    self.coordinator.finish(outcome);
                }
                drained = drain_lanes(&mut self.lanes), if draining => {
                    if drained.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Normalize, filter, and hand a record to its partition.
    ///
    /// Returns `false` if the partition's worker is gone.
    fn route(&mut self, record: SourceRecord) -> bool {
        let offset = record.offset;
        self.metrics.record_read();
        self.next_offset = offset.next();

        match self.chain.apply(record.bytes) {
            Verdict::Pass(event) => {
                let PartitionIndex(target) = self.partitioner.partition(&event.entity_id);
                let msg = WorkerMsg::Record(Envelope { offset, event });
                self.lanes[target].push(msg).is_ok()
            }
            Verdict::Filtered => {
                tracing::trace!("Filtered record at {offset:?}");
                self.metrics.record_filtered();
                true
            }
            Verdict::Malformed(err) => {
                tracing::warn!("Skipping malformed record at {offset:?}: {err}");
                self.metrics.record_malformed();
                true
            }
        }
    }

    /// Inject a barrier at the current offset into every partition and
    /// start waiting for acknowledgements.
    ///
    /// The checkpoint timeout runs from here, so a partition whose
    /// backlog keeps the barrier from reaching it fails the attempt.
    /// Returns `None` if a worker is gone.
    fn start_checkpoint(&mut self) -> Option<InFlight> {
        let (barrier, pending) = self.coordinator.begin(self.next_offset);
        for lane in &mut self.lanes {
            if lane.push(WorkerMsg::Barrier(barrier.clone())).is_err() {
                return None;
            }
        }
        // Workers hold the only ack senders from here on.
        drop(barrier);
        let id = pending.id();
        Some((id, tokio::spawn(pending.complete())))
    }
}

/// Wait for the in-flight checkpoint. Pends forever if there is none.
async fn join_in_flight(
    in_flight: &mut Option<InFlight>,
) -> Result<CheckpointMeta, CheckpointError> {
    let Some((id, task)) = in_flight.as_mut() else {
        return std::future::pending().await;
    };
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!("{}", prepend_tname(format!("checkpoint task failed: {err}")));
            Err(CheckpointError::Aborted(*id))
        }
    };
    *in_flight = None;
    outcome
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::errors::{SinkError, StoreError};
    use crate::inputs::{ChannelSource, TestingSource};
    use crate::outputs::{OutputRecord, Sink, TestingOutput};
    use crate::partition::PartitionCount;
    use crate::recovery::InMemCheckpointStore;

    fn config(parallelism: usize) -> PipelineConfig {
        PipelineConfig {
            parallelism,
            checkpoint_interval_ms: 60_000,
            checkpoint_timeout_ms: 5_000,
            min_pause_between_checkpoints_ms: 0,
            store_retry_attempts: 2,
            store_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn raw(entity_id: &str, event_type: &str, timestamp: &str) -> Vec<u8> {
        json!({
            "event_type": event_type,
            "user_id": entity_id,
            "timestamp": timestamp,
        })
        .to_string()
        .into_bytes()
    }

    /// `count` events for `entities` entities, cycling through them,
    /// one second apart.
    fn many(entities: usize, count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let ts = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
                raw(&format!("u{}", i % entities), "view", &ts.to_rfc3339())
            })
            .collect()
    }

    #[tokio::test]
    async fn single_user_sessions() {
        let records = vec![
            raw("u1", "click", "2024-01-01T10:00:00Z"),
            raw("u1", "view", "2024-01-01T10:05:00Z"),
            // 35 minutes later: past the 30 minute timeout.
            raw("u1", "purchase", "2024-01-01T10:40:00Z"),
        ];
        let output = TestingOutput::new();
        let report = Pipeline::new(config(2), TestingSource::new(records), output.clone())
            .run()
            .await
            .unwrap();

        let emitted = output.decoded().unwrap();
        assert_eq!(emitted.len(), 3);
        let sessions: Vec<u64> = emitted.iter().map(|r| r.session_count).collect();
        assert_eq!(sessions, vec![1, 1, 2]);
        assert_eq!(emitted[1].current_session_duration_secs, 300);
        assert_eq!(emitted[2].current_session_duration_secs, 0);

        let u1 = report.entity("u1").unwrap();
        assert_eq!(u1.total_event_count, 3);
        assert_eq!(u1.session_count, 2);
        assert_eq!(
            u1.event_type_histogram,
            BTreeMap::from([
                ("click".to_string(), 1),
                ("purchase".to_string(), 1),
                ("view".to_string(), 1),
            ])
        );
        assert_eq!(report.stats.processed, 3);
        assert_eq!(report.stats.emitted, 3);
    }

    #[tokio::test]
    async fn malformed_and_filtered_are_counted() {
        let records = vec![
            raw("u1", "click", "2024-01-01T10:00:00Z"),
            b"not json".to_vec(),
            br#"{"event_type": "click"}"#.to_vec(),
            raw("u1", "scroll", "2024-01-01T10:01:00Z"),
            raw("u2", "login", "2024-01-01T10:02:00Z"),
        ];
        let output = TestingOutput::new();
        let report = Pipeline::new(config(2), TestingSource::new(records), output.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.stats.events_read, 5);
        assert_eq!(report.stats.malformed, 2);
        assert_eq!(report.stats.filtered, 1);
        assert_eq!(report.stats.processed, 2);
        assert_eq!(output.records().len(), 2);
    }

    #[tokio::test]
    async fn entities_stay_isolated() {
        let records = many(50, 1000);
        let output = TestingOutput::new();
        let report = Pipeline::new(config(4), TestingSource::new(records), output.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.partitions.len(), 4);
        let partitioner = Partitioner::new(PartitionCount(4));
        let mut seen = BTreeSet::new();
        for part in &report.partitions {
            for entity in &part.entities {
                // Each entity lives only in the partition it routes to.
                assert_eq!(partitioner.partition(&entity.entity_id), part.partition);
                assert!(seen.insert(entity.entity_id.clone()));
                assert_eq!(entity.total_event_count, 20);
            }
        }
        assert_eq!(seen.len(), 50);

        // Per-entity output order follows input order.
        let mut last: BTreeMap<String, u64> = BTreeMap::new();
        for record in output.decoded().unwrap() {
            let prev = last.insert(record.entity_id.clone(), record.total_event_count);
            assert_eq!(prev.unwrap_or(0) + 1, record.total_event_count);
        }
    }

    #[tokio::test]
    async fn restart_resumes_from_checkpoint() {
        let store = Arc::new(InMemCheckpointStore::new());
        let first = vec![
            raw("u1", "click", "2024-01-01T10:00:00Z"),
            raw("u2", "view", "2024-01-01T10:00:01Z"),
            raw("u1", "view", "2024-01-01T10:00:02Z"),
        ];
        let source = TestingSource::new(first.clone());
        let report = Pipeline::new(config(2), source, TestingOutput::new())
            .with_store(store.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.last_checkpoint, Some(CheckpointId(1)));

        let mut both = first;
        both.push(raw("u1", "purchase", "2024-01-01T10:00:03Z"));
        both.push(raw("u2", "view", "2024-01-01T10:00:04Z"));
        let output = TestingOutput::new();
        let report = Pipeline::new(config(2), TestingSource::new(both), output.clone())
            .with_store(store.clone())
            .run()
            .await
            .unwrap();

        // Only the new records are read, applied to the restored state.
        assert_eq!(report.stats.events_read, 2);
        assert_eq!(output.records().len(), 2);
        assert_eq!(report.entity("u1").unwrap().total_event_count, 3);
        assert_eq!(report.entity("u2").unwrap().total_event_count, 2);
        assert_eq!(report.entity("u1").unwrap().session_count, 1);
        assert_eq!(report.last_checkpoint, Some(CheckpointId(2)));
    }

    #[tokio::test]
    async fn restore_with_more_partitions() {
        let store = Arc::new(InMemCheckpointStore::new());
        let first = many(12, 120);
        Pipeline::new(config(2), TestingSource::new(first.clone()), TestingOutput::new())
            .with_store(store.clone())
            .run()
            .await
            .unwrap();

        let mut both = first;
        both.extend(many(12, 24));
        let report = Pipeline::new(config(3), TestingSource::new(both), TestingOutput::new())
            .with_store(store.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.partitions.len(), 3);
        assert_eq!(report.entities().count(), 12);
        for entity in report.entities() {
            assert_eq!(entity.total_event_count, 12);
        }
        let meta = store.latest_complete_meta().unwrap().unwrap();
        assert_eq!(meta.partition_count, PartitionCount(3));
    }

    /// Delays every write so checkpoints can't finish in time.
    struct SlowStore {
        inner: Arc<InMemCheckpointStore>,
        delay: Duration,
    }

    impl CheckpointStore for SlowStore {
        fn put(
            &self,
            partition: PartitionIndex,
            checkpoint: CheckpointId,
            blob: &[u8],
        ) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.put(partition, checkpoint, blob)
        }

        fn mark_complete(&self, meta: &CheckpointMeta) -> Result<(), StoreError> {
            self.inner.mark_complete(meta)
        }

        fn latest_complete_meta(&self) -> Result<Option<CheckpointMeta>, StoreError> {
            self.inner.latest_complete_meta()
        }

        fn latest_complete(
            &self,
            partition: PartitionIndex,
        ) -> Result<Option<(CheckpointId, Vec<u8>)>, StoreError> {
            self.inner.latest_complete(partition)
        }

        fn garbage_collect(&self, older_than: CheckpointId) -> Result<usize, StoreError> {
            self.inner.garbage_collect(older_than)
        }
    }

    #[tokio::test]
    async fn timed_out_checkpoint_keeps_previous() {
        let store = Arc::new(InMemCheckpointStore::new());
        let first = many(3, 6);
        Pipeline::new(config(2), TestingSource::new(first.clone()), TestingOutput::new())
            .with_store(store.clone())
            .run()
            .await
            .unwrap();

        let slow = Arc::new(SlowStore {
            inner: store.clone(),
            delay: Duration::from_millis(300),
        });
        let mut both = first;
        both.extend(many(3, 3));
        let config = PipelineConfig {
            checkpoint_timeout_ms: 50,
            ..config(2)
        };
        let report = Pipeline::new(config, TestingSource::new(both), TestingOutput::new())
            .with_store(slow)
            .run()
            .await
            .unwrap();

        assert_eq!(report.stats.checkpoints_failed, 1);
        assert_eq!(report.last_checkpoint, Some(CheckpointId(1)));
        assert!(!report.degraded);
        let meta = store.latest_complete_meta().unwrap().unwrap();
        assert_eq!(meta.checkpoint_id, CheckpointId(1));
        assert_eq!(meta.input_offset, Offset(6));
    }

    /// Every store call fails.
    struct DownStore;

    impl CheckpointStore for DownStore {
        fn put(&self, _: PartitionIndex, _: CheckpointId, _: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn mark_complete(&self, _: &CheckpointMeta) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn latest_complete_meta(&self) -> Result<Option<CheckpointMeta>, StoreError> {
            Ok(None)
        }

        fn latest_complete(
            &self,
            _: PartitionIndex,
        ) -> Result<Option<(CheckpointId, Vec<u8>)>, StoreError> {
            Ok(None)
        }

        fn garbage_collect(&self, _: CheckpointId) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_outage_degrades_without_stopping() {
        let (tx, source) = ChannelSource::channel(16);
        let output = TestingOutput::new();
        let config = PipelineConfig {
            checkpoint_interval_ms: 10,
            ..config(2)
        };
        let handle = Pipeline::new(config, source, output.clone())
            .with_store(Arc::new(DownStore))
            .start()
            .await
            .unwrap();

        tx.send(raw("u1", "click", "2024-01-01T10:00:00Z")).await.unwrap();
        // Long enough for a checkpoint attempt to fail.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.status().degraded);
        tx.send(raw("u1", "view", "2024-01-01T10:00:01Z")).await.unwrap();
        drop(tx);

        let report = handle.join().await.unwrap();
        assert!(report.degraded);
        assert_eq!(report.last_checkpoint, None);
        assert_eq!(report.entity("u1").unwrap().total_event_count, 2);
        assert_eq!(output.records().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_takes_final_checkpoint() {
        let store = Arc::new(InMemCheckpointStore::new());
        let (tx, source) = ChannelSource::channel(16);
        let handle = Pipeline::new(config(3), source, TestingOutput::new())
            .with_store(store.clone())
            .start()
            .await
            .unwrap();

        for record in many(5, 10) {
            tx.send(record).await.unwrap();
        }
        while handle.status().processed < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown();
        let report = handle.join().await.unwrap();

        assert_eq!(report.last_checkpoint, Some(CheckpointId(1)));
        let meta = store.latest_complete_meta().unwrap().unwrap();
        assert_eq!(meta.input_offset, Offset(10));
        assert_eq!(meta.partition_count, PartitionCount(3));
    }

    /// Holds every send on one partition until the gate opens.
    #[derive(Clone)]
    struct GatedOutput {
        gated: PartitionIndex,
        gate: Arc<Semaphore>,
        collected: TestingOutput,
    }

    struct GatedSink {
        gate: Option<Arc<Semaphore>>,
        inner: Box<dyn Sink>,
    }

    #[async_trait]
    impl Sink for GatedSink {
        async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
            if let Some(gate) = &self.gate {
                let _open = gate.acquire().await.unwrap();
            }
            self.inner.send(record).await
        }
    }

    impl SinkBuilder for GatedOutput {
        fn build(&self, partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError> {
            Ok(Box::new(GatedSink {
                gate: (partition == self.gated).then(|| self.gate.clone()),
                inner: self.collected.build(partition)?,
            }))
        }
    }

    /// The first entity id `e0`, `e1`, ... that routes to `target`.
    fn entity_on(partitioner: &Partitioner, target: usize) -> String {
        (0..)
            .map(|i| format!("e{i}"))
            .find(|id| partitioner.partition(id) == PartitionIndex(target))
            .unwrap()
    }

    fn stuck_then_free(stuck: &str, free: &str) -> Vec<Vec<u8>> {
        (0..15)
            .map(|i| {
                let ts = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
                let entity_id = if i < 10 { stuck } else { free };
                raw(entity_id, "view", &ts.to_rfc3339())
            })
            .collect()
    }

    #[tokio::test]
    async fn stuck_sink_holds_up_only_its_partition() {
        let partitioner = Partitioner::new(PartitionCount(2));
        let stuck = entity_on(&partitioner, 0);
        let free = entity_on(&partitioner, 1);
        let gate = Arc::new(Semaphore::new(0));
        let output = GatedOutput {
            gated: PartitionIndex(0),
            gate: gate.clone(),
            collected: TestingOutput::new(),
        };
        let config = PipelineConfig {
            channel_capacity: 2,
            ..config(2)
        };
        let handle = Pipeline::new(
            config,
            TestingSource::new(stuck_then_free(&stuck, &free)),
            output.clone(),
        )
        .start()
        .await
        .unwrap();

        let emitted_for = |entity_id: &str| {
            output
                .collected
                .decoded()
                .unwrap()
                .iter()
                .filter(|record| record.entity_id == entity_id)
                .count()
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while emitted_for(&free) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("partition 1 never got its input");
        assert_eq!(emitted_for(&stuck), 0);
        assert_eq!(handle.status().events_read, 15);

        gate.add_permits(1);
        let report = handle.join().await.unwrap();
        assert_eq!(report.entity(&stuck).unwrap().total_event_count, 10);
        assert_eq!(report.entity(&free).unwrap().total_event_count, 5);
        assert_eq!(output.collected.records().len(), 15);
        assert_eq!(report.last_checkpoint, Some(CheckpointId(1)));
    }

    #[tokio::test]
    async fn stuck_partition_times_out_checkpoint() {
        let partitioner = Partitioner::new(PartitionCount(2));
        let stuck = entity_on(&partitioner, 0);
        let free = entity_on(&partitioner, 1);
        let gate = Arc::new(Semaphore::new(0));
        let output = GatedOutput {
            gated: PartitionIndex(0),
            gate: gate.clone(),
            collected: TestingOutput::new(),
        };
        let store = Arc::new(InMemCheckpointStore::new());
        let config = PipelineConfig {
            channel_capacity: 2,
            checkpoint_interval_ms: 20,
            checkpoint_timeout_ms: 100,
            ..config(2)
        };
        let (tx, source) = ChannelSource::channel(16);
        let handle = Pipeline::new(config, source, output)
            .with_store(store.clone())
            .start()
            .await
            .unwrap();
        for record in stuck_then_free(&stuck, &free) {
            tx.send(record).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.status().checkpoints_failed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("checkpoint never timed out");
        assert_eq!(store.latest_complete_meta().unwrap(), None);
        assert!(!handle.status().degraded);

        gate.add_permits(1);
        drop(tx);
        let report = handle.join().await.unwrap();
        assert!(report.last_checkpoint.is_some());
        let meta = store.latest_complete_meta().unwrap().unwrap();
        assert_eq!(meta.input_offset, Offset(15));
    }

    /// Disconnects on one send attempt across all partitions.
    #[derive(Clone)]
    struct FlakyOutput {
        calls: Arc<AtomicUsize>,
        fail_on: usize,
        collected: TestingOutput,
    }

    struct FlakySink {
        output: FlakyOutput,
        inner: Box<dyn Sink>,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
            let call = self.output.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.output.fail_on {
                return Err(SinkError::Disconnected("connection reset".into()));
            }
            self.inner.send(record).await
        }
    }

    impl SinkBuilder for FlakyOutput {
        fn build(&self, partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError> {
            Ok(Box::new(FlakySink {
                output: self.clone(),
                inner: self.collected.build(partition)?,
            }))
        }
    }

    #[tokio::test]
    async fn sink_crash_recovers_with_duplicates() {
        let output = FlakyOutput {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: 15,
            collected: TestingOutput::new(),
        };
        let report = Pipeline::new(config(2), TestingSource::new(many(4, 40)), output.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.stats.partition_restarts, 1);
        for entity in report.entities() {
            assert_eq!(entity.total_event_count, 10);
        }
        let emitted = output.collected.decoded().unwrap();
        assert!(emitted.len() >= 40);
        let unique: BTreeSet<_> = emitted
            .iter()
            .map(|r| (r.entity_id.clone(), r.timestamp, r.total_event_count))
            .collect();
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    async fn invalid_config_fails_start() {
        let source = TestingSource::new(Vec::<Vec<u8>>::new());
        let found = Pipeline::new(config(0), source, TestingOutput::new())
            .run()
            .await;
        assert!(matches!(found, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_offset_fails_start() {
        let store = Arc::new(InMemCheckpointStore::new());
        Pipeline::new(config(1), TestingSource::new(many(1, 5)), TestingOutput::new())
            .with_store(store.clone())
            .run()
            .await
            .unwrap();

        // The source no longer has the records the checkpoint covers.
        let found = Pipeline::new(config(1), TestingSource::new(many(1, 2)), TestingOutput::new())
            .with_store(store)
            .run()
            .await;
        assert!(matches!(found, Err(PipelineError::Source(_))));
    }
}
