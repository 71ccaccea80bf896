use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::TopicPartitionList;
use serde::{Deserialize, Serialize};

use crate::errors::SourceError;

use super::{Offset, Source, SourceRecord};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to read from in Kafka.
///
/// One source reads one partition of a topic, so record offsets are
/// that partition's Kafka offsets and a checkpoint's input offset is
/// where the consumer resumes. Run one pipeline per topic partition to
/// consume a whole topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSourceConfig {
    /// `host:port` of each broker.
    pub brokers: Vec<String>,
    pub topic: String,
    pub partition: i32,
    /// Keep waiting for new records at the end of the partition
    /// instead of ending the source.
    pub tail: bool,
    /// Passed through to librdkafka. Consumer group settings are
    /// ignored; offsets are managed by checkpoints.
    pub additional_configs: HashMap<String, String>,
}

impl Default for KafkaSourceConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: "user_events".to_string(),
            partition: 0,
            tail: true,
            additional_configs: HashMap::new(),
        }
    }
}

impl KafkaSourceConfig {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in &self.additional_configs {
            config.set(key, value);
        }
        config
            .set("group.id", "SESSIONFLOW_IGNORED")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("bootstrap.servers", self.brokers.join(","))
            .set("enable.partition.eof", (!self.tail).to_string());
        config
    }
}

/// Reads one Kafka topic partition.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    config: KafkaSourceConfig,
}

impl KafkaSource {
    /// Build the consumer. Nothing is fetched until
    /// [`Source::seek`].
    pub fn new(config: KafkaSourceConfig) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = config.client_config().create().map_err(|err| {
            SourceError::Unreachable(format!("can't build Kafka consumer: {err}"))
        })?;
        Ok(Self {
            consumer: Arc::new(consumer),
            config,
        })
    }
}

fn kafka_offset(offset: Offset) -> Result<rdkafka::Offset, SourceError> {
    i64::try_from(offset.0)
        .map(rdkafka::Offset::Offset)
        .map_err(|_| SourceError::Seek {
            offset: offset.0,
            reason: "past the largest Kafka offset".to_string(),
        })
}

fn record_offset(offset: i64) -> Result<Offset, SourceError> {
    u64::try_from(offset)
        .map(Offset)
        .map_err(|_| SourceError::Unreachable(format!("Kafka returned offset {offset}")))
}

#[async_trait]
impl Source for KafkaSource {
    /// Check the partition exists, then assign the consumer to it at
    /// `offset`. Records before the log start are skipped.
    async fn seek(&mut self, offset: Offset) -> Result<(), SourceError> {
        let consumer = self.consumer.clone();
        let topic = self.config.topic.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(&topic), METADATA_TIMEOUT)
        })
        .await
        .map_err(|err| SourceError::Unreachable(format!("metadata fetch failed: {err}")))?
        .map_err(|err| SourceError::Unreachable(format!("can't fetch topic metadata: {err}")))?;

        let partition_count = metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == self.config.topic)
            .map_or(0, |topic| topic.partitions().len());
        if self.config.partition < 0 || self.config.partition as usize >= partition_count {
            return Err(SourceError::Unreachable(format!(
                "topic {:?} has no partition {} ({partition_count} partitions)",
                self.config.topic, self.config.partition
            )));
        }

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.config.topic, self.config.partition, kafka_offset(offset)?)
            .map_err(|err| SourceError::Seek {
                offset: offset.0,
                reason: err.to_string(),
            })?;
        self.consumer
            .assign(&assignment)
            .map_err(|err| SourceError::Seek {
                offset: offset.0,
                reason: err.to_string(),
            })?;
        tracing::info!(
            "Reading Kafka topic {:?} partition {} from offset {}",
            self.config.topic,
            self.config.partition,
            offset.0
        );
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        match self.consumer.recv().await {
            Ok(msg) => Ok(Some(SourceRecord {
                offset: record_offset(msg.offset())?,
                bytes: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Err(KafkaError::PartitionEOF(partition)) => {
                tracing::debug!("Reached the end of Kafka partition {partition}");
                Ok(None)
            }
            Err(err) => Err(SourceError::Kafka(err)),
        }
    }
}

#[test]
fn client_config_fixes_offset_handling() {
    let config = KafkaSourceConfig {
        brokers: vec!["a:9092".to_string(), "b:9092".to_string()],
        tail: false,
        additional_configs: HashMap::from([
            ("enable.auto.commit".to_string(), "true".to_string()),
            ("fetch.min.bytes".to_string(), "1024".to_string()),
        ]),
        ..Default::default()
    };
    let client = config.client_config();
    assert_eq!(client.get("bootstrap.servers"), Some("a:9092,b:9092"));
    assert_eq!(client.get("enable.partition.eof"), Some("true"));
    // Checkpoints own the offsets.
    assert_eq!(client.get("enable.auto.commit"), Some("false"));
    assert_eq!(client.get("fetch.min.bytes"), Some("1024"));
}

#[test]
fn partial_config_takes_defaults() {
    let config: KafkaSourceConfig =
        serde_json::from_str(r#"{"topic": "clicks", "partition": 3}"#).unwrap();
    assert_eq!(config.topic, "clicks");
    assert_eq!(config.partition, 3);
    assert!(config.tail);
    assert_eq!(config.brokers, vec!["localhost:9092".to_string()]);
}

#[test]
fn offsets_convert_both_ways() {
    assert_eq!(kafka_offset(Offset(42)).unwrap(), rdkafka::Offset::Offset(42));
    assert!(matches!(
        kafka_offset(Offset(u64::MAX)),
        Err(SourceError::Seek { .. })
    ));
    assert_eq!(record_offset(7).unwrap(), Offset(7));
    assert!(record_offset(-1).is_err());
}
