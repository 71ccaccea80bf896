use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::errors::SinkError;
use crate::partition::PartitionIndex;

use super::{OutputRecord, Sink, SinkBuilder};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to write analytics records in Kafka.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaOutputConfig {
    /// `host:port` of each broker.
    pub brokers: Vec<String>,
    pub topic: String,
    /// How long a record may wait for room in the producer queue.
    pub queue_timeout_ms: u64,
    /// Passed through to librdkafka.
    pub additional_properties: HashMap<String, String>,
}

impl Default for KafkaOutputConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: "user_analytics".to_string(),
            queue_timeout_ms: 30_000,
            additional_properties: HashMap::new(),
        }
    }
}

impl KafkaOutputConfig {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.brokers.join(","));
        for (key, value) in &self.additional_properties {
            config.set(key, value);
        }
        config
    }
}

/// Produces each record to a Kafka topic keyed by entity id, so all
/// records of an entity land in one topic partition in order.
///
/// Every pipeline partition shares one producer.
#[derive(Clone)]
pub struct KafkaOutput {
    producer: FutureProducer,
    topic: String,
    queue_timeout: Duration,
}

impl KafkaOutput {
    pub fn new(config: &KafkaOutputConfig) -> Result<Self, SinkError> {
        let producer: FutureProducer = config.client_config().create().map_err(|err| {
            SinkError::Disconnected(format!("can't build Kafka producer: {err}"))
        })?;
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        })
    }
}

impl SinkBuilder for KafkaOutput {
    fn build(&self, _partition: PartitionIndex) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(KafkaSink {
            output: self.clone(),
        }))
    }
}

struct KafkaSink {
    output: KafkaOutput,
}

/// Only records the broker can never accept are skipped; everything
/// else means the producer is unusable.
fn classify(err: KafkaError) -> SinkError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage,
        ) => SinkError::Rejected(err.to_string()),
        _ => SinkError::Disconnected(err.to_string()),
    }
}

#[async_trait]
impl Sink for KafkaSink {
    #[tracing::instrument(name = "KafkaSink.send", level = "trace", skip_all)]
    async fn send(&mut self, record: OutputRecord) -> Result<(), SinkError> {
        let output = &self.output;
        let to_send = FutureRecord::to(&output.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_slice());
        output
            .producer
            .send(to_send, output.queue_timeout)
            .await
            .map(|_delivered| ())
            .map_err(|(err, _msg)| classify(err))
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        tracing::debug!("Flushing producer queue");
        let producer = self.output.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(|err| SinkError::Disconnected(format!("flush task failed: {err}")))?
            .map_err(classify)
    }
}

#[test]
fn client_config_passes_properties() {
    let config = KafkaOutputConfig {
        brokers: vec!["a:9092".to_string(), "b:9092".to_string()],
        additional_properties: HashMap::from([(
            "compression.type".to_string(),
            "lz4".to_string(),
        )]),
        ..Default::default()
    };
    let client = config.client_config();
    assert_eq!(client.get("bootstrap.servers"), Some("a:9092,b:9092"));
    assert_eq!(client.get("compression.type"), Some("lz4"));
}

#[test]
fn oversized_records_are_skipped() {
    let too_big = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
    assert!(classify(too_big).is_per_record());

    let down = KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown);
    assert!(matches!(classify(down), SinkError::Disconnected(_)));
}

#[test]
fn partial_config_takes_defaults() {
    let config: KafkaOutputConfig = serde_json::from_str(r#"{"topic": "sessions"}"#).unwrap();
    assert_eq!(config.topic, "sessions");
    assert_eq!(config.queue_timeout_ms, 30_000);
}
