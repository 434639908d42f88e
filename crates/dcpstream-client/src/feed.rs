//! Change Feed API
//!
//! The downstream contract: a consolidated, lazily consumed stream of
//! [`FeedEvent`]s with per-partition ordering, acknowledgement-gated
//! checkpointing, and per-partition status.
//!
//! ## Example
//!
//! ```ignore
//! use dcpstream_client::{Feed, StartPolicy};
//!
//! let mut feed = Feed::builder()
//!     .partitions((0..64).collect())
//!     .transport(transport)
//!     .checkpoint_store(store)
//!     .start_policy(StartPolicy::FromCheckpoint)
//!     .build()
//!     .await?;
//!
//! while let Some(event) = feed.next().await {
//!     apply(&event)?;
//!     feed.ack(event.partition, event.seq);
//! }
//! feed.close().await?;
//! ```
//!
//! `next()` yields events in worker-emit order: per-partition order is
//! guaranteed, cross-partition interleaving is not. `ack()` marks an event
//! durably handled downstream; only acknowledged seqnos are checkpointed,
//! which is what makes delivery at-least-once across restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use dcpstream_core::{FeedEvent, PartitionId};

use crate::backoff::BackoffPolicy;
use crate::config::{FeedConfig, StartPolicy};
use crate::error::{ClientError, Result};
use crate::filter::KeyFilter;
use crate::metrics;
use crate::observer::EventRouter;
use crate::shutdown::ShutdownHandle;
use crate::status::{FeedStatus, StatusBoard};
use crate::store::CheckpointStore;
use crate::supervisor::Supervisor;
use crate::transport::{StreamObserver, StreamTransport};
use crate::worker::{AckTable, Worker};

/// A running change feed over a set of partitions.
#[derive(Debug)]
pub struct Feed {
    events: mpsc::Receiver<FeedEvent>,
    acks: Arc<AckTable>,
    status: Arc<StatusBoard>,
    shutdown: ShutdownHandle,
    supervisor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl Feed {
    /// Create a new [`FeedBuilder`].
    pub fn builder() -> FeedBuilder {
        FeedBuilder::new()
    }

    /// Open a feed: spawn the worker pool, wire the observer, and run the
    /// barrier-synchronized initial open.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or fewer partitions
    /// than the configured quorum opened on the first attempt.
    pub async fn open(
        config: FeedConfig,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Feed> {
        config.validate()?;
        metrics::register_metrics();
        let config = Arc::new(config);

        let shutdown = ShutdownHandle::new();
        let acks = Arc::new(AckTable::new(&config.partitions));
        let status = Arc::new(StatusBoard::new(&config.partitions));
        let (feed_tx, feed_rx) = mpsc::channel(config.feed_buffer);
        let (notice_tx, notice_rx) = mpsc::channel(config.partitions.len().max(16));

        let mut worker_txs = Vec::with_capacity(config.worker_count);
        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let (tx, rx) = mpsc::channel(config.queue_depth);
            worker_txs.push(tx);
            let worker = Worker::new(
                id,
                rx,
                feed_tx.clone(),
                notice_tx.clone(),
                store.clone(),
                acks.clone(),
                status.clone(),
                &config,
                shutdown.clone(),
            );
            workers.push(tokio::spawn(worker.run()));
        }
        // Workers hold the only long-lived clones.
        drop(feed_tx);
        drop(notice_tx);

        let observer: Arc<dyn StreamObserver> =
            Arc::new(EventRouter::new(worker_txs.clone(), config.filter.clone()));
        let mut supervisor = Supervisor::new(
            transport,
            store,
            observer,
            worker_txs,
            config.clone(),
            notice_rx,
            status.clone(),
            shutdown.clone(),
        );

        if let Err(e) = supervisor.start().await {
            shutdown.shutdown();
            for worker in workers {
                let _ = worker.await;
            }
            return Err(e);
        }
        let supervisor = tokio::spawn(supervisor.run());

        Ok(Feed {
            events: feed_rx,
            acks,
            status,
            shutdown,
            supervisor: Some(supervisor),
            workers,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Next feed event, in worker-emit order. `None` once the feed has
    /// shut down and the channel is drained.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Acknowledge that the event `(partition, seqno)` has been durably
    /// handled downstream. Monotonic; acknowledging out of order is
    /// harmless.
    pub fn ack(&self, partition: PartitionId, seqno: u64) {
        self.acks.ack(partition, seqno);
    }

    /// Snapshot of per-partition state, progress, restarts, and errors.
    pub async fn status(&self) -> FeedStatus {
        self.status.snapshot().await
    }

    /// Close the feed: stop streams, drain workers under the drain
    /// deadline, and persist final checkpoints.
    pub async fn close(mut self) -> Result<()> {
        info!("closing feed");
        self.shutdown.shutdown();
        let supervisor = self.supervisor.take();
        let workers = std::mem::take(&mut self.workers);
        let join_all = async move {
            if let Some(supervisor) = supervisor {
                let _ = supervisor.await;
            }
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, join_all)
            .await
            .is_err()
        {
            warn!("drain deadline exceeded while closing feed");
        }
        Ok(())
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

/// Builder for constructing a [`Feed`].
pub struct FeedBuilder {
    config: FeedConfig,
    transport: Option<Arc<dyn StreamTransport>>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl FeedBuilder {
    pub fn new() -> Self {
        Self {
            config: FeedConfig::new(Vec::new()),
            transport: None,
            store: None,
        }
    }

    /// Set the partitions to consume. Required.
    pub fn partitions(mut self, partitions: Vec<PartitionId>) -> Self {
        self.config.partitions = partitions;
        self
    }

    /// Set the transport to open streams against. Required.
    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the checkpoint store. Required.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Number of worker tasks; partitions are sharded `p mod worker_count`.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Bounded inbox depth per worker.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    /// Bounded depth of the consolidated feed channel.
    pub fn feed_buffer(mut self, depth: usize) -> Self {
        self.config.feed_buffer = depth;
        self
    }

    /// Maximum events between checkpoint writes.
    pub fn checkpoint_interval_events(mut self, events: u64) -> Self {
        self.config.checkpoint_interval_events = events;
        self
    }

    /// Maximum wall time between checkpoint writes.
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    /// Reopen backoff bounds.
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Consecutive failed restarts after which a partition is abandoned.
    pub fn max_restart_attempts(mut self, attempts: u32) -> Self {
        self.config.max_restart_attempts = attempts;
        self
    }

    /// Timeout for a single stream open attempt.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Fraction of partitions that must open before the feed starts.
    pub fn open_quorum(mut self, quorum: f64) -> Self {
        self.config.open_quorum = quorum;
        self
    }

    /// Soft deadline for draining workers during close.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Initial seqno choice per partition.
    pub fn start_policy(mut self, policy: StartPolicy) -> Self {
        self.config.start_policy = policy;
        self
    }

    /// Key predicate applied before dispatch.
    pub fn filter(mut self, filter: Arc<dyn KeyFilter>) -> Self {
        self.config.filter = filter;
        self
    }

    /// Build and open the feed.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields (transport, checkpoint store,
    /// partitions) are missing, the configuration fails validation, or the
    /// initial open misses its quorum.
    pub async fn build(self) -> Result<Feed> {
        let transport = self
            .transport
            .ok_or_else(|| ClientError::Config("transport required".into()))?;
        let store = self
            .store
            .ok_or_else(|| ClientError::Config("checkpoint_store required".into()))?;
        Feed::open(self.config, transport, store).await
    }
}

impl Default for FeedBuilder {
    fn default() -> Self {
        Self::new()
    }
}
