//! Event Router
//!
//! The feed's implementation of the transport's [`StreamObserver`] callback
//! contract. Primarily routes events to the partition workers, and performs
//! two pieces of additional functionality on the way:
//!
//! - key-based filtering for document events (mutation, deletion), applied
//!   before dispatch so filtered keys never consume worker or feed
//!   capacity;
//! - classification of every callback into the internal [`StreamEvent`]
//!   union the workers consume.
//!
//! Dispatch awaits on the owning worker's bounded queue; when the queue is
//! full the transport task suspends here, which is how backpressure
//! propagates upstream. Control events (`Opened`, `Snapshot`, `End`,
//! `SeqnoAdvanced`) are never filtered.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use dcpstream_core::{
    DeletionEvent, MutationEvent, PartitionId, SeqnoAdvancedEvent, SnapshotEvent, StreamEndEvent,
    StreamEvent, StreamOpenEvent,
};

use crate::filter::KeyFilter;
use crate::metrics;
use crate::transport::StreamObserver;
use crate::worker::WorkerMessage;

/// Routes classified stream events to the worker owning each partition.
pub(crate) struct EventRouter {
    workers: Vec<mpsc::Sender<WorkerMessage>>,
    filter: Arc<dyn KeyFilter>,
}

impl EventRouter {
    pub(crate) fn new(workers: Vec<mpsc::Sender<WorkerMessage>>, filter: Arc<dyn KeyFilter>) -> Self {
        assert!(!workers.is_empty(), "at least one worker required");
        Self { workers, filter }
    }

    /// Stable partition-to-worker mapping. All events for a partition land
    /// on the same worker, which is what preserves per-partition FIFO.
    fn worker_for(&self, partition: PartitionId) -> &mpsc::Sender<WorkerMessage> {
        &self.workers[partition as usize % self.workers.len()]
    }

    async fn dispatch(&self, event: StreamEvent) {
        metrics::EVENTS_TOTAL.with_label_values(&[event.kind()]).inc();
        let partition = event.partition();
        if self
            .worker_for(partition)
            .send(WorkerMessage::Event(event))
            .await
            .is_err()
        {
            // Worker has shut down; only expected while the feed is closing.
            debug!(partition, "dropping event for stopped worker");
        }
    }
}

#[async_trait]
impl StreamObserver for EventRouter {
    async fn stream_open(&self, event: StreamOpenEvent) {
        self.dispatch(StreamEvent::Opened(event)).await;
    }

    async fn snapshot_marker(&self, event: SnapshotEvent) {
        self.dispatch(StreamEvent::Snapshot(event)).await;
    }

    async fn mutation(&self, event: MutationEvent) {
        if self.filter.is_filtered(&event.key) {
            metrics::EVENTS_FILTERED_TOTAL.inc();
            return;
        }
        self.dispatch(StreamEvent::Mutation(event)).await;
    }

    async fn deletion(&self, event: DeletionEvent) {
        if self.filter.is_filtered(&event.key) {
            metrics::EVENTS_FILTERED_TOTAL.inc();
            return;
        }
        self.dispatch(StreamEvent::Deletion(event)).await;
    }

    async fn expiration(&self, partition: PartitionId, key: Bytes) {
        // Not subscribed to expirations; they arrive as deletion events.
        warn!(
            partition,
            key = %String::from_utf8_lossy(&key),
            "unexpected expiration callback"
        );
    }

    async fn stream_end(&self, event: StreamEndEvent) {
        self.dispatch(StreamEvent::End(event)).await;
    }

    async fn seqno_advanced(&self, event: SeqnoAdvancedEvent) {
        self.dispatch(StreamEvent::SeqnoAdvanced(event)).await;
    }
}
