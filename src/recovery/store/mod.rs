//! Implementations of checkpoint stores.
//!
//! A store keeps opaque per-partition snapshot blobs keyed by
//! `(partition, checkpoint)` plus a record of which checkpoints
//! completed. Calls block, so async code runs them through
//! [`with_retry_blocking`].

use std::time::Duration;

use crate::config::PipelineConfig;
use crate::errors::{CheckpointError, StoreError};
use crate::partition::PartitionIndex;

use super::{backoff_delay, CheckpointId, CheckpointMeta};

pub mod in_mem;
pub mod noop;
pub mod sqlite;

pub trait CheckpointStore: Send + Sync {
    /// Durably write one partition's snapshot for an attempt.
    ///
    /// Writing the same key again replaces the blob.
    fn put(
        &self,
        partition: PartitionIndex,
        checkpoint: CheckpointId,
        blob: &[u8],
    ) -> Result<(), StoreError>;

    /// Record that every partition of a checkpoint has been written.
    ///
    /// Fails with [`StoreError::Incomplete`] if any snapshot is
    /// missing.
    fn mark_complete(&self, meta: &CheckpointMeta) -> Result<(), StoreError>;

    fn latest_complete_meta(&self) -> Result<Option<CheckpointMeta>, StoreError>;

    /// The newest complete checkpoint that has a snapshot for this
    /// partition.
    fn latest_complete(
        &self,
        partition: PartitionIndex,
    ) -> Result<Option<(CheckpointId, Vec<u8>)>, StoreError>;

    /// Delete everything belonging to checkpoints before
    /// `older_than`, complete or not. Returns how many snapshots were
    /// removed.
    fn garbage_collect(&self, older_than: CheckpointId) -> Result<usize, StoreError>;
}

/// How store calls are retried before a checkpoint gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            attempts: config.store_retry_attempts.max(1),
            backoff: config.store_retry_backoff(),
        }
    }

    /// Call `op` until it succeeds, fails permanently, or runs out of
    /// attempts. Sleeps the thread between attempts.
    ///
    /// Only a transient error that is still failing on the last attempt
    /// becomes [`CheckpointError::StoreUnavailable`].
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, CheckpointError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = backoff_delay(self.backoff, attempt);
                    tracing::warn!(
                        "{what} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                        self.attempts
                    );
                    std::thread::sleep(delay);
                }
                Err(source) if source.is_transient() => {
                    return Err(CheckpointError::StoreUnavailable {
                        attempts: attempt,
                        source,
                    })
                }
                Err(source) => {
                    tracing::warn!("{what} failed permanently: {source}");
                    return Err(CheckpointError::Store(source));
                }
            }
        }
    }
}

/// Run a retried store call on the blocking pool.
pub(crate) async fn with_retry_blocking<T, F>(
    policy: RetryPolicy,
    what: &'static str,
    op: F,
) -> Result<T, CheckpointError>
where
    T: Send + 'static,
    F: FnMut() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || policy.run(what, op))
        .await
        .unwrap_or_else(|err| {
            Err(CheckpointError::Store(StoreError::Unavailable(format!(
                "{what} panicked: {err}"
            ))))
        })
}

#[cfg(test)]
fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        backoff: Duration::from_millis(1),
    }
}

#[test]
fn retry_until_success() {
    let mut calls = 0;
    let found = fast_policy(3).run("test op", || {
        calls += 1;
        if calls < 3 {
            Err(StoreError::Unavailable("flaky".into()))
        } else {
            Ok(calls)
        }
    });
    assert_eq!(found.unwrap(), 3);
}

#[test]
fn retry_gives_up() {
    let mut calls = 0;
    let found: Result<(), _> = fast_policy(3).run("test op", || {
        calls += 1;
        Err(StoreError::Unavailable("down".into()))
    });
    assert!(matches!(
        found,
        Err(CheckpointError::StoreUnavailable { attempts: 3, .. })
    ));
    assert_eq!(calls, 3);
}

#[test]
fn no_retry_on_permanent_error() {
    let mut calls = 0;
    let found: Result<(), _> = fast_policy(5).run("test op", || {
        calls += 1;
        Err(StoreError::Corrupt("bad blob".into()))
    });
    assert!(matches!(
        found,
        Err(CheckpointError::Store(StoreError::Corrupt(_)))
    ));
    assert_eq!(calls, 1);
}
