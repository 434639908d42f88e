//! Feed configuration.
//!
//! [`FeedConfig`] carries everything the feed needs besides its injected
//! collaborators (transport, checkpoint store): the partition set, worker
//! sharding, queue bounds, checkpoint cadence, backoff bounds, restart
//! budget, and the key filter. Construct one via [`FeedConfig::new`] and
//! adjust fields, or use the `FeedBuilder` which validates on `build()`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dcpstream_core::PartitionId;

use crate::backoff::BackoffPolicy;
use crate::error::{ClientError, Result};
use crate::filter::{KeyFilter, NoFilter};

/// Where a partition stream starts when the feed opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// Ignore any checkpoint and start from seqno 0.
    FromZero,
    /// Resume from the persisted checkpoint; fall back to zero.
    FromCheckpoint,
    /// Start from the upstream's current high seqno, skipping history.
    FromNow,
}

impl fmt::Display for StartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPolicy::FromZero => write!(f, "from_zero"),
            StartPolicy::FromCheckpoint => write!(f, "from_checkpoint"),
            StartPolicy::FromNow => write!(f, "from_now"),
        }
    }
}

/// Configuration for a change feed.
#[derive(Clone)]
pub struct FeedConfig {
    /// Partitions this feed consumes.
    pub partitions: Vec<PartitionId>,

    /// Number of worker tasks; partitions are sharded `p mod worker_count`.
    pub worker_count: usize,

    /// Bounded inbox depth per worker. A full inbox backpressures the
    /// transport.
    pub queue_depth: usize,

    /// Bounded depth of the consolidated feed channel. A stalled consumer
    /// backpressures the workers.
    pub feed_buffer: usize,

    /// Maximum events processed between checkpoint writes.
    pub checkpoint_interval_events: u64,

    /// Maximum wall time between checkpoint writes.
    pub checkpoint_interval: Duration,

    /// Backoff bounds for stream reopen attempts.
    pub backoff: BackoffPolicy,

    /// Consecutive failed restart attempts after which a partition is
    /// abandoned.
    pub max_restart_attempts: u32,

    /// Timeout for a single stream open attempt. Expiry counts as a
    /// restart attempt.
    pub open_timeout: Duration,

    /// Fraction of partitions that must open before the feed starts
    /// (1.0 = all). Stragglers keep retrying in the background.
    pub open_quorum: f64,

    /// Soft deadline for draining workers during close.
    pub drain_timeout: Duration,

    /// Consecutive checkpoint save failures before the partition is
    /// flagged as durability-degraded.
    pub checkpoint_failure_threshold: u32,

    /// Initial seqno choice per partition.
    pub start_policy: StartPolicy,

    /// Key predicate applied before dispatch.
    pub filter: Arc<dyn KeyFilter>,
}

impl FeedConfig {
    /// Config with defaults for the given partition set.
    pub fn new(partitions: Vec<PartitionId>) -> Self {
        Self {
            partitions,
            worker_count: 4,
            queue_depth: 256,
            feed_buffer: 1024,
            checkpoint_interval_events: 100,
            checkpoint_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            max_restart_attempts: 5,
            open_timeout: Duration::from_secs(10),
            open_quorum: 1.0,
            drain_timeout: Duration::from_secs(10),
            checkpoint_failure_threshold: 5,
            start_policy: StartPolicy::FromCheckpoint,
            filter: Arc::new(NoFilter),
        }
    }

    /// Validate bounds; called by the builder and by `Feed::open`.
    pub fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(ClientError::Config("partitions required".into()));
        }
        if self.worker_count == 0 {
            return Err(ClientError::Config("worker_count must be > 0".into()));
        }
        if self.queue_depth == 0 || self.feed_buffer == 0 {
            return Err(ClientError::Config(
                "queue_depth and feed_buffer must be > 0".into(),
            ));
        }
        if self.checkpoint_interval_events == 0 {
            return Err(ClientError::Config(
                "checkpoint_interval_events must be > 0".into(),
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ClientError::Config(
                "checkpoint_interval must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.open_quorum) {
            return Err(ClientError::Config(
                "open_quorum must be within 0.0..=1.0".into(),
            ));
        }
        if self.backoff.min_delay > self.backoff.max_delay {
            return Err(ClientError::Config(
                "backoff min_delay must not exceed max_delay".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.partitions {
            if !seen.insert(*p) {
                return Err(ClientError::Config(format!("duplicate partition {}", p)));
            }
        }
        Ok(())
    }

    /// Number of partitions required by the open quorum.
    pub fn quorum_count(&self) -> usize {
        (self.partitions.len() as f64 * self.open_quorum).ceil() as usize
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("partitions", &self.partitions.len())
            .field("worker_count", &self.worker_count)
            .field("queue_depth", &self.queue_depth)
            .field("feed_buffer", &self.feed_buffer)
            .field("checkpoint_interval_events", &self.checkpoint_interval_events)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("max_restart_attempts", &self.max_restart_attempts)
            .field("open_timeout", &self.open_timeout)
            .field("open_quorum", &self.open_quorum)
            .field("start_policy", &self.start_policy)
            .field("filter", &self.filter.name())
            .finish()
    }
}
