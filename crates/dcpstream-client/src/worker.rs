//! Partition Workers
//!
//! A worker owns the single-writer ordering discipline for the partitions
//! sharded onto it (`partition mod worker_count`). Events for one partition
//! always land on the same worker and are processed in submission order, so
//! per-partition FIFO holds without any locking in the data path.
//!
//! ```text
//! EventRouter ──► bounded inbox ──► Worker loop ──► feed channel
//!                                        │
//!                                        ├── checkpoint store (cadenced)
//!                                        └── supervisor notices (ends,
//!                                            invariant violations)
//! ```
//!
//! ## Checkpoint gating
//!
//! The persisted seqno never advances past an event the downstream has not
//! acknowledged. A `SeqnoAdvanced` watermark may advance it without an ack,
//! but only while no delivered document is still unacknowledged; otherwise
//! a crash would skip redelivery of the unacked document.
//!
//! ## Failure containment
//!
//! A protocol invariant violation latches the partition as failed and
//! notifies the supervisor; other partitions on the same worker are
//! unaffected. Checkpoint save failures are retried at the next cadence
//! and, past a threshold, flag the partition as durability-degraded while
//! delivery continues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use dcpstream_core::{
    Checkpoint, Error as ProtocolError, FeedEvent, PartitionId, StreamEndReason, StreamEvent,
};

use crate::config::FeedConfig;
use crate::metrics;
use crate::shutdown::ShutdownHandle;
use crate::status::StatusBoard;
use crate::store::CheckpointStore;

/// Messages accepted by a worker's inbox.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// Sent by the supervisor immediately before each (re)open attempt;
    /// resets the partition's progress to the resume point. Always precedes
    /// any event of the new stream in the inbox.
    StreamOpened {
        partition: PartitionId,
        stream_uuid: u64,
        resume_seqno: u64,
    },
    /// A classified protocol event routed by the observer.
    Event(StreamEvent),
}

/// Notifications from workers to the supervisor.
#[derive(Debug)]
pub(crate) enum WorkerNotice {
    StreamEnded {
        partition: PartitionId,
        reason: StreamEndReason,
    },
    InvariantViolated {
        partition: PartitionId,
        error: ProtocolError,
    },
}

/// Lock-free acknowledgement high-watermarks, one slot per partition.
///
/// `Feed::ack` writes, the owning worker reads at checkpoint time. Slots
/// are monotonic, so late or duplicate acks are harmless.
#[derive(Debug)]
pub(crate) struct AckTable {
    slots: HashMap<PartitionId, AtomicU64>,
}

impl AckTable {
    pub(crate) fn new(partitions: &[PartitionId]) -> Self {
        Self {
            slots: partitions
                .iter()
                .map(|&p| (p, AtomicU64::new(0)))
                .collect(),
        }
    }

    pub(crate) fn ack(&self, partition: PartitionId, seqno: u64) {
        if let Some(slot) = self.slots.get(&partition) {
            slot.fetch_max(seqno, Ordering::AcqRel);
        }
    }

    pub(crate) fn acked(&self, partition: PartitionId) -> u64 {
        self.slots
            .get(&partition)
            .map(|s| s.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Running state for one partition inside a worker.
#[derive(Debug)]
struct PartitionProgress {
    stream_uuid: u64,
    current_seqno: u64,
    snapshot_start: u64,
    snapshot_end: u64,
    /// Highest document seqno pushed into the feed channel.
    last_delivered_seqno: u64,
    /// Highest seqno observed via `SeqnoAdvanced`.
    advanced_seqno: u64,
    /// Highest seqno successfully persisted.
    persisted_seqno: u64,
    events_since_checkpoint: u64,
    last_checkpoint: Instant,
    checkpoint_failures: u32,
    /// Stream currently open.
    active: bool,
    /// Invariant violation latch; events are dropped until the next
    /// `StreamOpened`.
    failed: bool,
}

impl PartitionProgress {
    fn reset(stream_uuid: u64, resume_seqno: u64) -> Self {
        Self {
            stream_uuid,
            current_seqno: resume_seqno,
            snapshot_start: resume_seqno,
            snapshot_end: resume_seqno,
            last_delivered_seqno: resume_seqno,
            advanced_seqno: 0,
            persisted_seqno: resume_seqno,
            events_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            checkpoint_failures: 0,
            active: true,
            failed: false,
        }
    }
}

/// One worker task of the pool.
pub(crate) struct Worker {
    id: usize,
    inbox: mpsc::Receiver<WorkerMessage>,
    feed_tx: mpsc::Sender<FeedEvent>,
    notices: mpsc::Sender<WorkerNotice>,
    store: Arc<dyn CheckpointStore>,
    acks: Arc<AckTable>,
    status: Arc<StatusBoard>,
    shutdown: ShutdownHandle,
    checkpoint_interval_events: u64,
    checkpoint_interval: Duration,
    checkpoint_failure_threshold: u32,
    progress: HashMap<PartitionId, PartitionProgress>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        inbox: mpsc::Receiver<WorkerMessage>,
        feed_tx: mpsc::Sender<FeedEvent>,
        notices: mpsc::Sender<WorkerNotice>,
        store: Arc<dyn CheckpointStore>,
        acks: Arc<AckTable>,
        status: Arc<StatusBoard>,
        config: &FeedConfig,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            id,
            inbox,
            feed_tx,
            notices,
            store,
            acks,
            status,
            shutdown,
            checkpoint_interval_events: config.checkpoint_interval_events,
            checkpoint_interval: config.checkpoint_interval,
            checkpoint_failure_threshold: config.checkpoint_failure_threshold,
            progress: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(worker = self.id, "worker started");
        let mut tick = tokio::time::interval(self.checkpoint_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = tick.tick() => self.cadence_checkpoints().await,
                _ = self.shutdown.wait() => break,
            }
        }

        // Final flush: queued-but-unprocessed events will be redelivered on
        // the next start, so only checkpoints need to go out.
        self.final_checkpoints().await;
        debug!(worker = self.id, "worker stopped");
    }

    async fn handle(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::StreamOpened {
                partition,
                stream_uuid,
                resume_seqno,
            } => {
                debug!(
                    worker = self.id,
                    partition, stream_uuid, resume_seqno, "partition stream (re)opened"
                );
                self.progress
                    .insert(partition, PartitionProgress::reset(stream_uuid, resume_seqno));
            }
            WorkerMessage::Event(event) => self.handle_event(event).await,
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) {
        let partition = event.partition();
        let Some(state) = self.progress.get_mut(&partition) else {
            warn!(worker = self.id, partition, "event before stream open, dropping");
            return;
        };
        if state.failed {
            return;
        }

        match event {
            StreamEvent::Opened(e) => {
                // Adopt the server-assigned history for checkpoint stamping.
                if let Some(latest) = e.failover_log.latest() {
                    state.stream_uuid = latest.uuid;
                }
            }
            StreamEvent::Snapshot(e) => {
                if e.end_seq < e.start_seq {
                    let err = ProtocolError::SnapshotInversion {
                        partition,
                        start: e.start_seq,
                        end: e.end_seq,
                    };
                    self.fail_partition(partition, err).await;
                    return;
                }
                state.snapshot_start = e.start_seq;
                state.snapshot_end = e.end_seq;
            }
            StreamEvent::Mutation(e) => {
                if let Err(err) = Self::check_document_seq(state, partition, e.seq) {
                    self.fail_partition(partition, err).await;
                    return;
                }
                let seq = e.seq;
                if !self.deliver(e.into_feed_event(), "mutation").await {
                    return;
                }
                if let Some(state) = self.progress.get_mut(&partition) {
                    state.current_seqno = seq;
                    state.last_delivered_seqno = seq;
                    state.events_since_checkpoint += 1;
                }
                self.maybe_checkpoint(partition, false).await;
            }
            StreamEvent::Deletion(e) => {
                if let Err(err) = Self::check_document_seq(state, partition, e.seq) {
                    self.fail_partition(partition, err).await;
                    return;
                }
                let seq = e.seq;
                if !self.deliver(e.into_feed_event(), "deletion").await {
                    return;
                }
                if let Some(state) = self.progress.get_mut(&partition) {
                    state.current_seqno = seq;
                    state.last_delivered_seqno = seq;
                    state.events_since_checkpoint += 1;
                }
                self.maybe_checkpoint(partition, false).await;
            }
            StreamEvent::SeqnoAdvanced(e) => {
                if e.seq <= state.current_seqno {
                    let err = ProtocolError::SeqnoRegression {
                        partition,
                        seq: e.seq,
                        current: state.current_seqno,
                    };
                    self.fail_partition(partition, err).await;
                    return;
                }
                state.current_seqno = e.seq;
                state.advanced_seqno = e.seq;
                state.events_since_checkpoint += 1;
                self.maybe_checkpoint(partition, false).await;
            }
            StreamEvent::End(e) => {
                self.maybe_checkpoint(partition, true).await;
                if let Some(state) = self.progress.get_mut(&partition) {
                    state.active = false;
                }
                debug!(worker = self.id, partition, reason = %e.reason, "stream ended");
                let _ = self
                    .notices
                    .send(WorkerNotice::StreamEnded {
                        partition,
                        reason: e.reason,
                    })
                    .await;
            }
        }
    }

    fn check_document_seq(
        state: &PartitionProgress,
        partition: PartitionId,
        seq: u64,
    ) -> Result<(), ProtocolError> {
        if seq <= state.current_seqno {
            return Err(ProtocolError::SeqnoRegression {
                partition,
                seq,
                current: state.current_seqno,
            });
        }
        if seq < state.snapshot_start || seq > state.snapshot_end {
            return Err(ProtocolError::SeqnoOutsideSnapshot {
                partition,
                seq,
                start: state.snapshot_start,
                end: state.snapshot_end,
            });
        }
        Ok(())
    }

    /// Push a feed event downstream. Returns false if the feed is shutting
    /// down, in which case the partition state must not advance.
    async fn deliver(&self, event: FeedEvent, opcode: &'static str) -> bool {
        let delivered = tokio::select! {
            res = self.feed_tx.send(event) => res.is_ok(),
            _ = self.shutdown.wait() => false,
        };
        if delivered {
            metrics::FEED_EVENTS_TOTAL.with_label_values(&[opcode]).inc();
        }
        delivered
    }

    async fn fail_partition(&mut self, partition: PartitionId, error: ProtocolError) {
        error!(worker = self.id, partition, %error, "protocol invariant violated, halting partition");
        if let Some(state) = self.progress.get_mut(&partition) {
            state.failed = true;
            state.active = false;
        }
        let _ = self
            .notices
            .send(WorkerNotice::InvariantViolated { partition, error })
            .await;
    }

    async fn cadence_checkpoints(&mut self) {
        let due: Vec<PartitionId> = self
            .progress
            .iter()
            .filter(|(_, s)| s.active && !s.failed)
            .map(|(&p, _)| p)
            .collect();
        for partition in due {
            self.maybe_checkpoint(partition, false).await;
        }
    }

    async fn final_checkpoints(&mut self) {
        let partitions: Vec<PartitionId> = self
            .progress
            .iter()
            .filter(|(_, s)| !s.failed)
            .map(|(&p, _)| p)
            .collect();
        for partition in partitions {
            self.maybe_checkpoint(partition, true).await;
        }
    }

    /// Persist the partition's checkpoint if the cadence says so (or
    /// unconditionally when forced) and the ack-gated seqno has advanced.
    async fn maybe_checkpoint(&mut self, partition: PartitionId, force: bool) {
        let Some(state) = self.progress.get_mut(&partition) else {
            return;
        };

        let events_due = state.events_since_checkpoint >= self.checkpoint_interval_events;
        let time_due = state.last_checkpoint.elapsed() >= self.checkpoint_interval;
        if !(force || events_due || time_due) {
            return;
        }

        let acked = self.acks.acked(partition);
        let mut seqno = acked.min(state.current_seqno);
        // The advanced watermark carries no document, so it may move the
        // checkpoint without an ack, but never over an unacked delivery.
        if acked >= state.last_delivered_seqno {
            seqno = seqno.max(state.advanced_seqno).min(state.current_seqno);
        }

        if seqno <= state.persisted_seqno {
            // Nothing new to persist; restart the time cadence so the tick
            // does not spin.
            state.last_checkpoint = Instant::now();
            return;
        }

        let checkpoint = if seqno >= state.snapshot_start && seqno <= state.snapshot_end {
            Checkpoint {
                stream_uuid: state.stream_uuid,
                last_seqno: seqno,
                snapshot_start: state.snapshot_start,
                snapshot_end: state.snapshot_end,
            }
        } else {
            // Acked progress lags the current window; collapse so the
            // persisted record keeps its invariant.
            Checkpoint::rollback_to(state.stream_uuid, seqno)
        };

        match self.store.save(partition, &checkpoint).await {
            Ok(()) => {
                state.persisted_seqno = seqno;
                state.events_since_checkpoint = 0;
                state.last_checkpoint = Instant::now();
                if state.checkpoint_failures >= self.checkpoint_failure_threshold {
                    self.status.set_degraded(partition, false).await;
                }
                state.checkpoint_failures = 0;
                metrics::CHECKPOINT_WRITES_TOTAL.inc();
                self.status.set_last_seqno(partition, seqno).await;
            }
            Err(e) => {
                state.checkpoint_failures += 1;
                metrics::CHECKPOINT_FAILURES_TOTAL.inc();
                warn!(
                    worker = self.id,
                    partition,
                    failures = state.checkpoint_failures,
                    error = %e,
                    "checkpoint save failed"
                );
                if state.checkpoint_failures == self.checkpoint_failure_threshold {
                    error!(
                        worker = self.id,
                        partition, "checkpoint durability degraded, delivery continues"
                    );
                    self.status.set_degraded(partition, true).await;
                }
            }
        }
    }
}
