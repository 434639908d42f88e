//! Stream Supervisor
//!
//! Owns the lifecycle of every partition stream: the barrier-synchronized
//! initial open, reopen-with-backoff on transient stream ends, rollback
//! reconciliation against the failover log, and abandonment once a
//! partition exhausts its restart budget.
//!
//! ```text
//!            open/close streams
//! Supervisor ───────────────────► transport
//!     ▲                               │ callbacks
//!     │ stream-end & invariant        ▼
//!     └────────────────────────── workers
//! ```
//!
//! Open attempts run in spawned tasks so a slow upstream never blocks the
//! supervisor loop; each attempt resolves to exactly one [`OpenReport`]
//! fed back into the loop. The supervisor task itself is the only writer
//! of per-partition lifecycle state.
//!
//! ## Stream-end policy
//!
//! | Reason | Action |
//! |---|---|
//! | `Ok` | partition complete, terminal |
//! | `Closed` | consumer-initiated, terminal |
//! | `StateChanged`, `Disconnected` | reopen from checkpoint after backoff |
//! | `Rollback(n)` | truncate checkpoint, reconcile, reopen |
//! | `Filter`, `TooSlow` | recoverable, reopen after backoff |
//! | `Unknown` | abandon |
//!
//! Every failed or recovered attempt counts against the partition's
//! consecutive-attempt budget; a successful open resets it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use dcpstream_core::{Checkpoint, PartitionId, StreamEndReason};

use crate::config::{FeedConfig, StartPolicy};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::shutdown::ShutdownHandle;
use crate::status::{PartitionState, StatusBoard};
use crate::store::CheckpointStore;
use crate::transport::{
    OpenOutcome, OpenStreamRequest, StreamObserver, StreamTransport, TransportError, SEQNO_MAX,
};
use crate::worker::{WorkerMessage, WorkerNotice};

/// Resolution of one spawned open attempt.
#[derive(Debug)]
enum OpenReport {
    Opened {
        partition: PartitionId,
    },
    /// The checkpoint was truncated to a rollback point; an immediate
    /// reopen is wanted.
    RolledBack {
        partition: PartitionId,
    },
    Failed {
        partition: PartitionId,
        error: ClientError,
    },
}

/// Everything a spawned open attempt needs, shared by `Arc`.
struct OpenContext {
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn CheckpointStore>,
    observer: Arc<dyn StreamObserver>,
    worker_txs: Vec<mpsc::Sender<WorkerMessage>>,
    config: Arc<FeedConfig>,
    reports: mpsc::Sender<OpenReport>,
}

impl OpenContext {
    fn worker_for(&self, partition: PartitionId) -> &mpsc::Sender<WorkerMessage> {
        &self.worker_txs[partition as usize % self.worker_txs.len()]
    }
}

pub(crate) struct Supervisor {
    ctx: Arc<OpenContext>,
    notices: mpsc::Receiver<WorkerNotice>,
    reports_rx: mpsc::Receiver<OpenReport>,
    status: Arc<StatusBoard>,
    shutdown: ShutdownHandle,
    /// Consecutive failed attempts per partition; reset on success.
    attempts: HashMap<PartitionId, u32>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn CheckpointStore>,
        observer: Arc<dyn StreamObserver>,
        worker_txs: Vec<mpsc::Sender<WorkerMessage>>,
        config: Arc<FeedConfig>,
        notices: mpsc::Receiver<WorkerNotice>,
        status: Arc<StatusBoard>,
        shutdown: ShutdownHandle,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(config.partitions.len().max(16));
        let ctx = Arc::new(OpenContext {
            transport,
            store,
            observer,
            worker_txs,
            config,
            reports: reports_tx,
        });
        Self {
            ctx,
            notices,
            reports_rx,
            status,
            shutdown,
            attempts: HashMap::new(),
        }
    }

    /// Barrier-synchronized initial open.
    ///
    /// Every partition gets a concurrent open attempt; the feed starts once
    /// all first attempts have resolved and at least the configured quorum
    /// opened. Partitions that failed their first attempt continue through
    /// the normal restart path in the background.
    pub(crate) async fn start(&mut self) -> Result<()> {
        let partitions = self.ctx.config.partitions.clone();
        let total = partitions.len();
        info!(partitions = total, "opening partition streams");

        for &partition in &partitions {
            spawn_open(self.ctx.clone(), self.shutdown.clone(), partition, Duration::ZERO);
        }

        let mut pending = total;
        let mut opened = 0usize;
        while pending > 0 {
            let report = tokio::select! {
                Some(report) = self.reports_rx.recv() => report,
                _ = self.shutdown.wait() => return Err(ClientError::Closed),
            };
            match report {
                OpenReport::Opened { partition } => {
                    pending -= 1;
                    opened += 1;
                    self.on_opened(partition).await;
                }
                OpenReport::RolledBack { partition } => {
                    // Still counts toward this partition's first resolution
                    // only once it stops rolling back or gets abandoned.
                    if self.count_attempt(partition, "rollback").await {
                        spawn_open(
                            self.ctx.clone(),
                            self.shutdown.clone(),
                            partition,
                            Duration::ZERO,
                        );
                    } else {
                        pending -= 1;
                    }
                }
                OpenReport::Failed { partition, error } => {
                    pending -= 1;
                    self.on_open_failed(partition, error).await;
                }
            }
        }

        let required = self.ctx.config.quorum_count();
        if opened < required {
            error!(opened, required, "initial open quorum not reached");
            return Err(ClientError::QuorumNotReached { opened, required });
        }
        info!(opened, total, "feed started");
        Ok(())
    }

    /// Supervision loop: consumes worker notices and open reports until
    /// shutdown, then closes all remaining streams.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                report = self.reports_rx.recv() => match report {
                    Some(report) => self.handle_report(report).await,
                    None => break,
                },
                notice = self.notices.recv() => match notice {
                    Some(notice) => self.handle_notice(notice).await,
                    None => break,
                },
            }
        }
        self.close_streams().await;
        debug!("supervisor stopped");
    }

    async fn handle_report(&mut self, report: OpenReport) {
        match report {
            OpenReport::Opened { partition } => self.on_opened(partition).await,
            OpenReport::RolledBack { partition } => {
                if self.count_attempt(partition, "rollback").await {
                    spawn_open(
                        self.ctx.clone(),
                        self.shutdown.clone(),
                        partition,
                        Duration::ZERO,
                    );
                }
            }
            OpenReport::Failed { partition, error } => {
                self.on_open_failed(partition, error).await;
            }
        }
    }

    async fn handle_notice(&mut self, notice: WorkerNotice) {
        match notice {
            WorkerNotice::StreamEnded { partition, reason } => {
                self.on_stream_end(partition, reason).await;
            }
            WorkerNotice::InvariantViolated { partition, error } => {
                self.abandon(partition, error.to_string()).await;
            }
        }
    }

    async fn on_opened(&mut self, partition: PartitionId) {
        self.attempts.insert(partition, 0);
        self.status.set_state(partition, PartitionState::Running).await;
        debug!(partition, "stream running");
    }

    async fn on_open_failed(&mut self, partition: PartitionId, error: ClientError) {
        // Retrying cannot fix a permanent transport failure.
        if matches!(
            error,
            ClientError::Transport(TransportError::Permanent(_))
        ) {
            self.abandon(partition, error.to_string()).await;
            return;
        }
        self.status.set_error(partition, error.to_string()).await;
        if self.count_attempt(partition, "open_failed").await {
            let attempt = self.attempts.get(&partition).copied().unwrap_or(0);
            let delay = self.ctx.config.backoff.jittered(attempt.saturating_sub(1));
            warn!(partition, attempt, ?delay, error = %error, "stream open failed, backing off");
            self.status.set_state(partition, PartitionState::Backoff).await;
            spawn_open(self.ctx.clone(), self.shutdown.clone(), partition, delay);
        }
    }

    async fn on_stream_end(&mut self, partition: PartitionId, reason: StreamEndReason) {
        match reason {
            StreamEndReason::Ok => {
                info!(partition, "partition complete");
                self.status.set_state(partition, PartitionState::Completed).await;
            }
            StreamEndReason::Closed => {
                self.status.set_state(partition, PartitionState::Closed).await;
            }
            StreamEndReason::Rollback(seqno) => {
                if self.count_attempt(partition, "rollback").await {
                    self.status.set_state(partition, PartitionState::Backoff).await;
                    spawn_rollback(self.ctx.clone(), self.shutdown.clone(), partition, seqno);
                }
            }
            StreamEndReason::StateChanged
            | StreamEndReason::Disconnected
            | StreamEndReason::Filter
            | StreamEndReason::TooSlow => {
                let label = end_reason_label(&reason);
                if self.count_attempt(partition, label).await {
                    let attempt = self.attempts.get(&partition).copied().unwrap_or(0);
                    let delay = self.ctx.config.backoff.jittered(attempt.saturating_sub(1));
                    warn!(partition, %reason, ?delay, "stream ended, scheduling reopen");
                    self.status.set_state(partition, PartitionState::Backoff).await;
                    self.status.set_error(partition, reason.to_string()).await;
                    spawn_open(self.ctx.clone(), self.shutdown.clone(), partition, delay);
                }
            }
            StreamEndReason::Unknown(detail) => {
                self.abandon(partition, format!("unknown stream end: {}", detail))
                    .await;
            }
        }
    }

    /// Count a restart attempt. Returns false (and abandons the partition)
    /// once the budget is exhausted.
    async fn count_attempt(&mut self, partition: PartitionId, reason: &'static str) -> bool {
        metrics::STREAM_RESTARTS_TOTAL
            .with_label_values(&[reason])
            .inc();
        self.status.record_restart(partition).await;
        let attempts = self.attempts.entry(partition).or_insert(0);
        *attempts += 1;
        if *attempts > self.ctx.config.max_restart_attempts {
            let attempts = *attempts - 1;
            self.abandon(
                partition,
                ClientError::Abandoned(partition, attempts).to_string(),
            )
            .await;
            return false;
        }
        true
    }

    async fn abandon(&mut self, partition: PartitionId, error: String) {
        error!(partition, %error, "abandoning partition");
        self.status.set_state(partition, PartitionState::Abandoned).await;
        self.status.set_error(partition, error).await;
        if let Err(e) = self.ctx.transport.close_stream(partition).await {
            debug!(partition, error = %e, "close after abandon");
        }
    }

    async fn close_streams(&mut self) {
        for &partition in &self.ctx.config.partitions {
            let terminal = self
                .status
                .state_of(partition)
                .await
                .map(|s| s.is_terminal())
                .unwrap_or(true);
            if !terminal {
                if let Err(e) = self.ctx.transport.close_stream(partition).await {
                    debug!(partition, error = %e, "close stream during shutdown");
                }
                self.status.set_state(partition, PartitionState::Closed).await;
            }
        }
    }
}

fn end_reason_label(reason: &StreamEndReason) -> &'static str {
    match reason {
        StreamEndReason::Ok => "ok",
        StreamEndReason::Closed => "closed",
        StreamEndReason::StateChanged => "state_changed",
        StreamEndReason::Disconnected => "disconnected",
        StreamEndReason::Rollback(_) => "rollback",
        StreamEndReason::Filter => "filter",
        StreamEndReason::TooSlow => "too_slow",
        StreamEndReason::Unknown(_) => "unknown",
    }
}

/// Spawn one open attempt; resolves to exactly one report.
fn spawn_open(
    ctx: Arc<OpenContext>,
    shutdown: ShutdownHandle,
    partition: PartitionId,
    delay: Duration,
) {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => return,
            }
        }
        if shutdown.is_shutdown() {
            return;
        }
        let report = match try_open(&ctx, partition).await {
            Ok(report) => report,
            Err(error) => OpenReport::Failed { partition, error },
        };
        let _ = ctx.reports.send(report).await;
    });
}

/// Spawn the rollback procedure for a stream-end rollback, where only the
/// locally persisted failover log is available for reconciliation.
fn spawn_rollback(
    ctx: Arc<OpenContext>,
    shutdown: ShutdownHandle,
    partition: PartitionId,
    seqno: u64,
) {
    tokio::spawn(async move {
        if shutdown.is_shutdown() {
            return;
        }
        let report = match truncate_to_local_history(&ctx, partition, seqno).await {
            Ok(()) => OpenReport::RolledBack { partition },
            Err(error) => OpenReport::Failed { partition, error },
        };
        let _ = ctx.reports.send(report).await;
    });
}

async fn truncate_to_local_history(
    ctx: &OpenContext,
    partition: PartitionId,
    seqno: u64,
) -> Result<()> {
    let local = ctx.store.failover_log(partition).await?;
    let uuid = local
        .entry_containing(seqno)
        .or_else(|| local.latest())
        .map(|e| e.uuid)
        .unwrap_or(0);
    let truncated = Checkpoint::rollback_to(uuid, seqno);
    warn!(partition, seqno, uuid, "stream-end rollback, truncating checkpoint");
    ctx.store.truncate(partition, &truncated).await
}

/// One open attempt: derive the resume point, reset the worker, open the
/// stream, and reconcile the failover log with the outcome.
async fn try_open(ctx: &OpenContext, partition: PartitionId) -> Result<OpenReport> {
    let checkpoint = resume_checkpoint(ctx, partition).await?;
    let request = OpenStreamRequest {
        partition,
        stream_uuid: checkpoint.stream_uuid,
        start_seqno: checkpoint.last_seqno,
        end_seqno: SEQNO_MAX,
        snapshot_start: checkpoint.snapshot_start,
        snapshot_end: checkpoint.snapshot_end,
    };

    // Reset worker-side progress before any event of the new stream can be
    // routed; inbox FIFO guarantees the reset is seen first.
    ctx.worker_for(partition)
        .send(WorkerMessage::StreamOpened {
            partition,
            stream_uuid: request.stream_uuid,
            resume_seqno: request.start_seqno,
        })
        .await
        .map_err(|_| ClientError::Closed)?;

    let outcome = tokio::time::timeout(
        ctx.config.open_timeout,
        ctx.transport.open_stream(request, ctx.observer.clone()),
    )
    .await
    .map_err(|_| ClientError::OpenTimeout(ctx.config.open_timeout))??;

    match outcome {
        OpenOutcome::Accepted { failover_log } => {
            // Adopt the server's accepted history as ours.
            ctx.store.replace_failover(partition, failover_log).await?;
            Ok(OpenReport::Opened { partition })
        }
        OpenOutcome::Rollback {
            seqno,
            failover_log,
        } => {
            let local = ctx.store.failover_log(partition).await?;
            let (uuid, rollback_seqno) = match local.common_ancestor(&failover_log) {
                Some(ancestor) => (ancestor.uuid, ancestor.seqno.min(seqno)),
                // No shared history: restart the partition from zero under
                // the server's current identity.
                None => (failover_log.latest().map(|e| e.uuid).unwrap_or(0), 0),
            };
            warn!(
                partition,
                requested = request.start_seqno,
                rollback_seqno,
                uuid,
                "open rolled back, truncating checkpoint"
            );
            let truncated = Checkpoint::rollback_to(uuid, rollback_seqno);
            ctx.store.truncate(partition, &truncated).await?;
            ctx.store.replace_failover(partition, failover_log).await?;
            Ok(OpenReport::RolledBack { partition })
        }
    }
}

/// Derive the resume checkpoint for a partition from the start policy.
async fn resume_checkpoint(ctx: &OpenContext, partition: PartitionId) -> Result<Checkpoint> {
    match ctx.config.start_policy {
        StartPolicy::FromZero => Ok(Checkpoint::default()),
        StartPolicy::FromCheckpoint => {
            Ok(ctx.store.load(partition).await?.unwrap_or_default())
        }
        StartPolicy::FromNow => {
            let seqno = ctx.transport.latest_seqno(partition).await?;
            let uuid = ctx
                .store
                .failover_log(partition)
                .await?
                .latest()
                .map(|e| e.uuid)
                .unwrap_or(0);
            Ok(Checkpoint::rollback_to(uuid, seqno))
        }
    }
}
