//! Per-Partition Status
//!
//! Shared view of partition lifecycle state, exposed through
//! `Feed::status()`. The supervisor writes state transitions and errors;
//! workers write progress (`last_seqno`) and durability degradation. Reads
//! take a snapshot so callers never hold the lock.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::RwLock;

use dcpstream_core::PartitionId;

use crate::metrics;

/// Lifecycle state of one partition within the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// Stream not yet opened.
    Pending,
    /// Stream open and delivering.
    Running,
    /// Stream down; a reopen attempt is scheduled.
    Backoff,
    /// The requested end seqno was reached.
    Completed,
    /// Closed by the consumer.
    Closed,
    /// Given up after exhausting the restart budget or violating a
    /// protocol invariant.
    Abandoned,
}

impl PartitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionState::Pending => "pending",
            PartitionState::Running => "running",
            PartitionState::Backoff => "backoff",
            PartitionState::Completed => "completed",
            PartitionState::Closed => "closed",
            PartitionState::Abandoned => "abandoned",
        }
    }

    /// Whether the partition can never deliver again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PartitionState::Completed | PartitionState::Closed | PartitionState::Abandoned
        )
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one partition as reported by `Feed::status()`.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub state: PartitionState,
    /// Highest seqno persisted for the partition.
    pub last_seqno: u64,
    /// Cumulative restart attempts over the feed's lifetime.
    pub restarts: u32,
    /// Checkpoint persistence is failing; delivery continues.
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl PartitionStatus {
    fn new() -> Self {
        Self {
            state: PartitionState::Pending,
            last_seqno: 0,
            restarts: 0,
            degraded: false,
            last_error: None,
        }
    }
}

/// Per-partition status snapshot, keyed by partition.
pub type FeedStatus = HashMap<PartitionId, PartitionStatus>;

/// Shared status map. Writes happen on lifecycle transitions and checkpoint
/// saves only, never on the per-event path.
#[derive(Debug)]
pub(crate) struct StatusBoard {
    inner: RwLock<HashMap<PartitionId, PartitionStatus>>,
}

impl StatusBoard {
    pub(crate) fn new(partitions: &[PartitionId]) -> Self {
        let mut map = HashMap::with_capacity(partitions.len());
        for &p in partitions {
            map.insert(p, PartitionStatus::new());
        }
        metrics::register_metrics();
        metrics::PARTITION_STATES
            .with_label_values(&[PartitionState::Pending.as_str()])
            .set(partitions.len() as i64);
        Self {
            inner: RwLock::new(map),
        }
    }

    pub(crate) async fn set_state(&self, partition: PartitionId, state: PartitionState) {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.get_mut(&partition) {
            if status.state != state {
                metrics::PARTITION_STATES
                    .with_label_values(&[status.state.as_str()])
                    .dec();
                metrics::PARTITION_STATES
                    .with_label_values(&[state.as_str()])
                    .inc();
                status.state = state;
            }
        }
    }

    pub(crate) async fn record_restart(&self, partition: PartitionId) {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.get_mut(&partition) {
            status.restarts += 1;
        }
    }

    pub(crate) async fn set_error(&self, partition: PartitionId, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.get_mut(&partition) {
            status.last_error = Some(error.into());
        }
    }

    pub(crate) async fn set_last_seqno(&self, partition: PartitionId, seqno: u64) {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.get_mut(&partition) {
            status.last_seqno = status.last_seqno.max(seqno);
        }
    }

    pub(crate) async fn set_degraded(&self, partition: PartitionId, degraded: bool) {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.get_mut(&partition) {
            status.degraded = degraded;
        }
    }

    pub(crate) async fn state_of(&self, partition: PartitionId) -> Option<PartitionState> {
        self.inner.read().await.get(&partition).map(|s| s.state)
    }

    pub(crate) async fn snapshot(&self) -> FeedStatus {
        self.inner.read().await.clone()
    }
}
