//! Sinks for analytics records.
//!
//! Each partition owns one [`Sink`], built at startup by a
//! [`SinkBuilder`]. Records are keyed by entity id so a downstream
//! consumer can deduplicate the replays that follow a restart.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::errors::SinkError;
use crate::partition::PartitionIndex;
use crate::session::AnalyticsRecord;

mod kafka_output;
pub use self::kafka_output::{KafkaOutput, KafkaOutputConfig};

/// A serialized analytics record, keyed by entity id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutputRecord {
    pub(crate) fn encode(record: &AnalyticsRecord) -> Result<Self, SinkError> {
        Ok(Self {
            key: record.entity_id.clone(),
            payload: serde_json::to_vec(record)?,
        })
    }

    pub fn decode(&self) -> Result<AnalyticsRecord, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[async_trait]
pub trait Sink: Send {
    /// Hand one record over.
    ///
    /// [`SinkError::is_per_record`] errors mean just this record was
    /// refused; any other error crashes the owning partition.
    async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError>;

    /// Called once when the partition shuts down cleanly.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Makes the sink for each partition.
pub trait SinkBuilder: Send + Sync {
    fn build(&self, partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError>;
}

/// Writes each record as a line of JSON to stdout.
pub struct StdOutput;

impl SinkBuilder for StdOutput {
    fn build(&self, _partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(StdOutSink {
            stdout: tokio::io::stdout(),
        }))
    }
}

struct StdOutSink {
    stdout: tokio::io::Stdout,
}

#[async_trait]
impl Sink for StdOutSink {
    async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
        let mut line = record.payload;
        line.push(b'\n');
        self.stdout.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.stdout.flush().await?;
        Ok(())
    }
}

/// Forwards records onto a bounded channel shared by all partitions.
///
/// A full channel blocks the partition, which pushes back on the
/// dispatcher. Dropping the receiver crashes every partition.
pub struct ChannelOutput {
    tx: mpsc::Sender<OutputRecord>,
}

impl ChannelOutput {
    pub fn new(tx: mpsc::Sender<OutputRecord>) -> Self {
        Self { tx }
    }

    /// A builder and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl SinkBuilder for ChannelOutput {
    fn build(&self, _partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(ChannelSink {
            tx: self.tx.clone(),
        }))
    }
}

struct ChannelSink {
    tx: mpsc::Sender<OutputRecord>,
}

#[async_trait]
impl Sink for ChannelSink {
    async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| SinkError::Disconnected("output channel closed".to_string()))
    }
}

/// Collects every record in memory. Cloning shares the collection.
#[derive(Clone, Default)]
pub struct TestingOutput {
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl TestingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything collected so far, in arrival order.
    pub fn records(&self) -> Vec<OutputRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn decoded(&self) -> Result<Vec<AnalyticsRecord>, serde_json::Error> {
        self.records().iter().map(OutputRecord::decode).collect()
    }
}

impl SinkBuilder for TestingOutput {
    fn build(&self, _partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(TestingSink {
            records: self.records.clone(),
        }))
    }
}

struct TestingSink {
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

#[async_trait]
impl Sink for TestingSink {
    async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError::Disconnected("collection poisoned".to_string()))?
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
fn sample_record(entity: &str) -> AnalyticsRecord {
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    AnalyticsRecord {
        entity_id: entity.to_string(),
        event_type: "click".to_string(),
        timestamp: at,
        processed_at: at,
        total_event_count: 1,
        session_count: 1,
        session_id: format!("{entity}_{}", at.timestamp()),
        event_type_histogram: BTreeMap::from([("click".to_string(), 1)]),
        current_session_duration_secs: 0,
    }
}

#[tokio::test]
async fn testing_output_collects_across_partitions() {
    let output = TestingOutput::new();
    let mut first = output.build(PartitionIndex(0)).unwrap();
    let mut second = output.build(PartitionIndex(1)).unwrap();

    first
        .send(OutputRecord::encode(&sample_record("u1")).unwrap())
        .await
        .unwrap();
    second
        .send(OutputRecord::encode(&sample_record("u2")).unwrap())
        .await
        .unwrap();

    let found = output.records();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].key, "u1");
    assert_eq!(output.decoded().unwrap()[1], sample_record("u2"));
}

#[tokio::test]
async fn channel_output_disconnects() {
    let (output, rx) = ChannelOutput::channel(4);
    let mut sink = output.build(PartitionIndex(0)).unwrap();
    drop(rx);

    let found = sink
        .send(OutputRecord::encode(&sample_record("u1")).unwrap())
        .await;
    assert!(matches!(found, Err(SinkError::Disconnected(_))));
}
