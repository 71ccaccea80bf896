//! Keyed, stateful processing of user activity events.
//!
//! Raw JSON records are read from a [`inputs::Source`], normalized into
//! [`event::Event`]s, filtered by type, and routed by entity id to a
//! fixed set of partitions. Each partition keeps per-entity counters
//! and sessions in a [`session::SessionStateManager`] and emits one
//! [`session::AnalyticsRecord`] per event to its [`outputs::Sink`].
//!
//! State is checkpointed periodically with aligned barriers (see
//! [`recovery`]); on restart the latest complete checkpoint is restored
//! and the source is replayed from the offset it recorded. Output is
//! at-least-once: records after the restored checkpoint are emitted
//! again and can be deduplicated with
//! [`session::AnalyticsRecord::dedup_key`].
//!
//! Start with [`run::Pipeline`].

pub mod config;
pub mod errors;
pub mod event;
pub mod ingest;
pub mod inputs;
pub mod metrics;
pub mod outputs;
pub mod partition;
pub mod recovery;
pub mod run;
pub mod session;
pub mod tracing;
pub(crate) mod webserver;
pub mod worker;

pub use crate::config::PipelineConfig;
pub use crate::errors::PipelineError;
pub use crate::run::{Pipeline, PipelineHandle, RunReport};
