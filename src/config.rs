//! Pipeline configuration.
//!
//! Reading configuration from files or the environment is left to the
//! embedding program; this only defines the recognized options, their
//! defaults and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::partition::PartitionCount;

/// Every knob the runtime reads.
///
/// Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of partitions, and so of workers.
    pub parallelism: usize,
    pub checkpoint_interval_ms: u64,
    pub checkpoint_timeout_ms: u64,
    pub min_pause_between_checkpoints_ms: u64,
    /// Inactivity gap that ends a session.
    pub session_timeout_seconds: u64,
    /// Event types that pass the filter. Empty accepts every type.
    pub accepted_event_types: Vec<String>,
    /// Raw record field holding the entity id.
    pub entity_id_field: String,
    /// Bound of each partition's input queue.
    pub channel_capacity: usize,
    /// Records the dispatcher holds back for a partition whose queue is
    /// full. Reading the source pauses only while some partition is
    /// over this limit.
    pub partition_backlog_limit: usize,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    /// How many complete checkpoints survive garbage collection.
    pub retained_checkpoints: u64,
    /// Consecutive crash recoveries allowed per partition before the
    /// pipeline gives up.
    pub max_partition_restarts: u32,
    /// Records a partition keeps for replay since its last committed
    /// checkpoint.
    pub replay_log_capacity: usize,
    /// Events kept per open session. Older ones are dropped from the
    /// session; counters are unaffected. Unbounded when unset.
    pub max_session_events: Option<usize>,
    /// Port for the status and metrics API. Disabled when unset.
    pub api_port: Option<u16>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            checkpoint_interval_ms: 60_000,
            checkpoint_timeout_ms: 300_000,
            min_pause_between_checkpoints_ms: 500,
            session_timeout_seconds: 1800,
            accepted_event_types: ["click", "view", "purchase", "login"]
                .into_iter()
                .map(String::from)
                .collect(),
            entity_id_field: "user_id".to_string(),
            channel_capacity: 1024,
            partition_backlog_limit: 100_000,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 100,
            retained_checkpoints: 1,
            max_partition_restarts: 3,
            replay_log_capacity: 100_000,
            max_session_events: None,
            api_port: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("parallelism", self.parallelism as u64),
            ("checkpoint_interval_ms", self.checkpoint_interval_ms),
            ("checkpoint_timeout_ms", self.checkpoint_timeout_ms),
            ("session_timeout_seconds", self.session_timeout_seconds),
            ("channel_capacity", self.channel_capacity as u64),
            ("partition_backlog_limit", self.partition_backlog_limit as u64),
            ("store_retry_attempts", self.store_retry_attempts as u64),
            ("retained_checkpoints", self.retained_checkpoints),
            ("replay_log_capacity", self.replay_log_capacity as u64),
            ("max_session_events", self.max_session_events.map_or(1, |max| max as u64)),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.checkpoint_timeout_ms < self.min_pause_between_checkpoints_ms {
            return Err(ConfigError::TimeoutShorterThanPause {
                timeout_ms: self.checkpoint_timeout_ms,
                pause_ms: self.min_pause_between_checkpoints_ms,
            });
        }
        if self.entity_id_field.trim().is_empty() {
            return Err(ConfigError::EmptyEntityField);
        }
        Ok(())
    }

    pub fn partition_count(&self) -> PartitionCount {
        PartitionCount(self.parallelism)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn min_pause_between_checkpoints(&self) -> Duration {
        Duration::from_millis(self.min_pause_between_checkpoints_ms)
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_timeout_seconds as i64)
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }
}

#[test]
fn defaults_are_valid() {
    let config = PipelineConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.parallelism, 4);
    assert_eq!(config.checkpoint_interval(), Duration::from_secs(60));
    assert_eq!(config.checkpoint_timeout(), Duration::from_secs(300));
    assert_eq!(config.session_timeout(), chrono::Duration::minutes(30));
}

#[test]
fn partial_config_takes_defaults() {
    let config: PipelineConfig =
        serde_json::from_str(r#"{"parallelism": 2, "accepted_event_types": ["click"]}"#).unwrap();
    assert_eq!(config.parallelism, 2);
    assert_eq!(config.accepted_event_types, vec!["click".to_string()]);
    assert_eq!(config.min_pause_between_checkpoints_ms, 500);
    assert_eq!(config.entity_id_field, "user_id");
}

#[test]
fn zero_parallelism_rejected() {
    let config = PipelineConfig {
        parallelism: 0,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Zero {
            field: "parallelism"
        })
    ));
}

#[test]
fn timeout_shorter_than_pause_rejected() {
    let config = PipelineConfig {
        checkpoint_timeout_ms: 100,
        min_pause_between_checkpoints_ms: 500,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::TimeoutShorterThanPause { .. })
    ));
}

#[test]
fn session_event_cap_must_keep_something() {
    let uncapped = PipelineConfig::default();
    assert!(uncapped.validate().is_ok());

    let config = PipelineConfig {
        max_session_events: Some(0),
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Zero {
            field: "max_session_events"
        })
    ));

    let config = PipelineConfig {
        partition_backlog_limit: 0,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Zero {
            field: "partition_backlog_limit"
        })
    ));
}
