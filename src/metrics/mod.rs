use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Once;

use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
    KeyValue,
};
use prometheus::default_registry;
use serde::Serialize;

use crate::partition::PartitionIndex;
use crate::recovery::CheckpointId;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub(crate) fn initialize_metrics() -> Result<(), String> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("sessionflow")
        .build()
        .map_err(|err| err.to_string())?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| err.to_string())?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

static INIT: Once = Once::new();

/// Install the Prometheus exporter once per process.
///
/// Must run before [`PipelineMetrics::new`] for the pipeline's
/// instruments to be exported.
pub(crate) fn ensure_metrics_initialized() {
    INIT.call_once(|| {
        if let Err(err) = initialize_metrics() {
            tracing::warn!("Unable to initialize metrics exporter: {err}");
        }
    });
}

/// Render everything in the default registry in the Prometheus text
/// format.
pub(crate) fn gather_prometheus() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let mut buf = Vec::new();
    prometheus::TextEncoder::new().encode(&default_registry().gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|err| prometheus::Error::Msg(err.to_string()))
}

/// Running totals kept alongside the exported instruments, for the
/// status API and the run report.
#[derive(Debug, Default)]
struct Totals {
    events_read: AtomicU64,
    malformed: AtomicU64,
    filtered: AtomicU64,
    processed: AtomicU64,
    emitted: AtomicU64,
    sink_errors: AtomicU64,
    partition_restarts: AtomicU64,
    checkpoints_completed: AtomicU64,
    checkpoints_failed: AtomicU64,
    last_checkpoint: AtomicU64,
    degraded: AtomicBool,
}

/// Point-in-time copy of a pipeline's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_read: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub processed: u64,
    pub emitted: u64,
    pub sink_errors: u64,
    pub partition_restarts: u64,
    pub checkpoints_completed: u64,
    pub checkpoints_failed: u64,
    pub last_checkpoint: Option<CheckpointId>,
    pub degraded: bool,
}

/// All instruments for one pipeline.
pub struct PipelineMetrics {
    events_read: Counter<u64>,
    malformed: Counter<u64>,
    filtered: Counter<u64>,
    processed: Counter<u64>,
    emitted: Counter<u64>,
    sink_errors: Counter<u64>,
    partition_restarts: Counter<u64>,
    checkpoints_completed: Counter<u64>,
    checkpoints_failed: Counter<u64>,
    pub(crate) snapshot_duration: Histogram<f64>,
    pub(crate) sink_send_duration: Histogram<f64>,
    event_latency: Histogram<f64>,
    totals: Totals,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let meter = global::meter("sessionflow");
        Self {
            events_read: meter
                .u64_counter("events_read_count")
                .with_description("number of raw records read from the source")
                .init(),
            malformed: meter
                .u64_counter("events_malformed_count")
                .with_description("number of raw records rejected by the normalizer")
                .init(),
            filtered: meter
                .u64_counter("events_filtered_count")
                .with_description("number of events dropped by the event type filter")
                .init(),
            processed: meter
                .u64_counter("events_processed_count")
                .with_description("number of events applied to entity state")
                .init(),
            emitted: meter
                .u64_counter("records_emitted_count")
                .with_description("number of analytics records accepted by the sink")
                .init(),
            sink_errors: meter
                .u64_counter("sink_error_count")
                .with_description("number of analytics records the sink refused")
                .init(),
            partition_restarts: meter
                .u64_counter("partition_restart_count")
                .with_description("number of partition crash recoveries")
                .init(),
            checkpoints_completed: meter
                .u64_counter("checkpoint_completed_count")
                .with_description("number of checkpoints marked complete")
                .init(),
            checkpoints_failed: meter
                .u64_counter("checkpoint_failed_count")
                .with_description("number of checkpoint attempts discarded")
                .init(),
            snapshot_duration: meter
                .f64_histogram("snapshot_duration_seconds")
                .with_description("time to serialize a partition's state at a barrier")
                .init(),
            sink_send_duration: meter
                .f64_histogram("sink_send_duration_seconds")
                .with_description("time spent waiting on the sink per record")
                .init(),
            event_latency: meter
                .f64_histogram("event_latency_duration_seconds")
                .with_description("time from normalization to sink acceptance")
                .init(),
            totals: Totals::default(),
        }
    }

    pub(crate) fn partition_labels(partition: PartitionIndex) -> Vec<KeyValue> {
        vec![KeyValue::new("partition", partition.0.to_string())]
    }

    pub(crate) fn record_read(&self) {
        self.events_read.add(1, &[]);
        self.totals.events_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.add(1, &[]);
        self.totals.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self) {
        self.filtered.add(1, &[]);
        self.totals.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self, labels: &[KeyValue]) {
        self.processed.add(1, labels);
        self.totals.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self, labels: &[KeyValue], latency_secs: f64) {
        self.emitted.add(1, labels);
        self.event_latency.record(latency_secs, labels);
        self.totals.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sink_error(&self, labels: &[KeyValue]) {
        self.sink_errors.add(1, labels);
        self.totals.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self, labels: &[KeyValue]) {
        self.partition_restarts.add(1, labels);
        self.totals
            .partition_restarts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_completed(&self, id: CheckpointId) {
        self.checkpoints_completed.add(1, &[]);
        self.totals
            .checkpoints_completed
            .fetch_add(1, Ordering::Relaxed);
        self.totals.last_checkpoint.store(id.0, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_failed(&self) {
        self.checkpoints_failed.add(1, &[]);
        self.totals
            .checkpoints_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Note the checkpoint a run resumed from.
    pub(crate) fn set_last_checkpoint(&self, id: CheckpointId) {
        self.totals.last_checkpoint.store(id.0, Ordering::Relaxed);
    }

    pub(crate) fn set_degraded(&self) {
        self.totals.degraded.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let t = &self.totals;
        let last = t.last_checkpoint.load(Ordering::Relaxed);
        StatsSnapshot {
            events_read: t.events_read.load(Ordering::Relaxed),
            malformed: t.malformed.load(Ordering::Relaxed),
            filtered: t.filtered.load(Ordering::Relaxed),
            processed: t.processed.load(Ordering::Relaxed),
            emitted: t.emitted.load(Ordering::Relaxed),
            sink_errors: t.sink_errors.load(Ordering::Relaxed),
            partition_restarts: t.partition_restarts.load(Ordering::Relaxed),
            checkpoints_completed: t.checkpoints_completed.load(Ordering::Relaxed),
            checkpoints_failed: t.checkpoints_failed.load(Ordering::Relaxed),
            // IDs start at 1, so 0 means none yet.
            last_checkpoint: (last > 0).then_some(CheckpointId(last)),
            degraded: t.degraded.load(Ordering::Relaxed),
        }
    }
}

#[test]
fn totals_track_records() {
    let metrics = PipelineMetrics::new();
    let labels = PipelineMetrics::partition_labels(PartitionIndex(0));
    metrics.record_read();
    metrics.record_read();
    metrics.record_malformed();
    metrics.record_processed(&labels);
    metrics.record_checkpoint_completed(CheckpointId(3));

    let found = metrics.snapshot();
    assert_eq!(found.events_read, 2);
    assert_eq!(found.malformed, 1);
    assert_eq!(found.processed, 1);
    assert_eq!(found.last_checkpoint, Some(CheckpointId(3)));
    assert!(!found.degraded);
}

#[test]
fn with_timer_returns_body() {
    let metrics = PipelineMetrics::new();
    let labels = PipelineMetrics::partition_labels(PartitionIndex(1));
    let found = with_timer!(metrics.snapshot_duration, labels, 40 + 2);
    assert_eq!(found, 42);
}
