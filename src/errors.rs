//! Error types for every stage of the pipeline.
//!
//! Only [`PipelineError`] ends a run. Everything else is either
//! handled where it happens (dropped events, discarded checkpoints)
//! or folded into a [`PipelineError`] by the runtime.

use std::time::Duration;

use thiserror::Error;

use crate::partition::PartitionIndex;
use crate::recovery::CheckpointId;

/// A raw record that can't be turned into an event.
///
/// These are dropped and counted; never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEventError {
    #[error("record is not valid JSON: {0}")]
    NotJson(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("field {field:?} has unsupported type {found}")]
    WrongType { field: String, found: &'static str },
    #[error("entity id is empty")]
    EmptyEntityId,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("checkpoint timeout ({timeout_ms}ms) must not be shorter than the min pause ({pause_ms}ms)")]
    TimeoutShorterThanPause { timeout_ms: u64, pause_ms: u64 },
    #[error("unknown log level {0:?}")]
    LogLevel(String),
    #[error("entity id field name is empty")]
    EmptyEntityField,
}

/// Errors from a [`crate::recovery::CheckpointStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    #[error("checkpoint store lock poisoned")]
    Poisoned,
    #[error("corrupt checkpoint data: {0}")]
    Corrupt(String),
    #[error("checkpoint {checkpoint:?} has {found} of {expected} partition snapshots")]
    Incomplete {
        checkpoint: CheckpointId,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            StoreError::Corrupt(_) | StoreError::Poisoned | StoreError::Incomplete { .. }
        )
    }
}

/// Why a checkpoint attempt did not complete.
///
/// A failed attempt is discarded; the previous complete checkpoint
/// stays the recovery point.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint {checkpoint:?} timed out after {timeout:?}; {acked} of {expected} partitions acknowledged")]
    Timeout {
        checkpoint: CheckpointId,
        timeout: Duration,
        acked: usize,
        expected: usize,
    },
    /// A transient store outage outlasted every retry. Checkpointing
    /// is turned off for the rest of the run.
    #[error("checkpoint store unavailable after {attempts} attempts")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    /// The store refused this attempt for good; only it is discarded.
    #[error("checkpoint store rejected the attempt")]
    Store(#[source] StoreError),
    #[error("partition {partition:?} could not snapshot checkpoint {checkpoint:?}: {reason}")]
    SnapshotFailed {
        partition: PartitionIndex,
        checkpoint: CheckpointId,
        reason: String,
    },
    #[error("checkpoint {0:?} aborted; a partition stopped before acknowledging")]
    Aborted(CheckpointId),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),
    #[error("can't seek source to offset {offset}: {reason}")]
    Seek { offset: u64, reason: String },
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink can no longer accept records.
    #[error("sink disconnected: {0}")]
    Disconnected(String),
    /// A single record was refused; later records may still succeed.
    #[error("sink rejected record: {0}")]
    Rejected(String),
    #[error("can't encode analytics record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Whether this error only affects the record that caused it.
    pub fn is_per_record(&self) -> bool {
        matches!(self, SinkError::Rejected(_) | SinkError::Encode(_))
    }
}

/// A partition worker lost its in-memory state.
#[derive(Error, Debug)]
pub enum PartitionCrash {
    #[error("panicked while applying an event: {0}")]
    Panicked(String),
    #[error("sink failed")]
    Sink(#[source] SinkError),
    #[error("can't decode recovery snapshot: {0}")]
    Restore(String),
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checkpoint {checkpoint:?} is missing partition {partition:?}")]
    MissingPartition {
        checkpoint: CheckpointId,
        partition: PartitionIndex,
    },
    #[error("partition {partition:?} has checkpoint {found:?} but {expected:?} is the latest complete one")]
    Inconsistent {
        partition: PartitionIndex,
        expected: CheckpointId,
        found: CheckpointId,
    },
    #[error("can't decode snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors that stop the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("can't start source")]
    Source(#[from] SourceError),
    #[error("can't start sink for partition {partition:?}")]
    Sink {
        partition: PartitionIndex,
        #[source]
        source: SinkError,
    },
    #[error("can't restore from checkpoint store")]
    Recovery(#[from] RecoveryError),
    #[error("partition {partition:?} failed after {restarts} restarts")]
    PartitionFailed {
        partition: PartitionIndex,
        restarts: u32,
        #[source]
        source: PartitionCrash,
    },
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Prefix each line of a message with the current thread name.
///
/// Panic payloads lose their origin once they cross a task boundary,
/// so this is attached before logging them.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Render a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let msg = std::thread::Builder::new()
        .name("worker-2".to_string())
        .spawn(|| prepend_tname("first\nsecond".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(msg, "<worker-2> first\n<worker-2> second\n");
}

#[test]
fn panic_message_reads_str_and_string() {
    let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
    assert_eq!(panic_message(payload), "boom");

    let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).unwrap_err();
    assert_eq!(panic_message(payload), "formatted 7");
}

#[test]
fn only_corrupt_store_errors_are_permanent() {
    assert!(StoreError::Unavailable("down".into()).is_transient());
    assert!(!StoreError::Corrupt("bad".into()).is_transient());
    assert!(!StoreError::Poisoned.is_transient());
    assert!(!StoreError::Incomplete {
        checkpoint: CheckpointId(1),
        found: 1,
        expected: 2,
    }
    .is_transient());
}
