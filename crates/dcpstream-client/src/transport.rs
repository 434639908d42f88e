//! Transport Contract
//!
//! The upstream change protocol is an external library from the feed's
//! point of view. This module defines the two seams it plugs into:
//!
//! - [`StreamTransport`]: what the supervisor calls — open a partition
//!   stream with resume parameters, close it again, ask for the current
//!   high seqno.
//! - [`StreamObserver`]: what the transport calls back into — one method
//!   per protocol callback. The feed passes its event router as the
//!   observer when opening streams.
//!
//! ## Callback ordering contract
//!
//! For an accepted open, the transport must invoke `stream_open` before any
//! data callbacks for that stream, and must stop invoking callbacks for a
//! partition after `close_stream` returns. Callbacks for a single partition
//! are serial; callbacks across partitions may be concurrent.
//!
//! Observer methods are async so that a full worker queue suspends the
//! transport task — that suspension is the backpressure path. A transport
//! binding a synchronous callback API bridges with `blocking_send`-style
//! adapters on its own threads.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use dcpstream_core::{
    DeletionEvent, FailoverLog, MutationEvent, PartitionId, SeqnoAdvancedEvent, SnapshotEvent,
    StreamEndEvent, StreamOpenEvent,
};

/// Open-ended stream: consume until the stream ends or is closed.
pub const SEQNO_MAX: u64 = u64::MAX;

/// Parameters for opening one partition stream, derived from the
/// partition's checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenStreamRequest {
    pub partition: PartitionId,
    /// Stream history the consumer believes it is resuming.
    pub stream_uuid: u64,
    /// Resume point: events strictly greater than this seqno are wanted.
    pub start_seqno: u64,
    /// Upper bound, usually [`SEQNO_MAX`].
    pub end_seqno: u64,
    /// Snapshot window enclosing `start_seqno`.
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

impl OpenStreamRequest {
    /// A from-zero open for a partition with no history.
    pub fn from_zero(partition: PartitionId) -> Self {
        Self {
            partition,
            stream_uuid: 0,
            start_seqno: 0,
            end_seqno: SEQNO_MAX,
            snapshot_start: 0,
            snapshot_end: 0,
        }
    }
}

/// Upstream's response to a stream open.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// The resume point was accepted; the server's failover log for the
    /// partition accompanies it.
    Accepted { failover_log: FailoverLog },
    /// The server's history has diverged: the consumer must resume at or
    /// below `seqno`. The server's failover log drives reconciliation.
    Rollback { seqno: u64, failover_log: FailoverLog },
}

/// Transport-level failures, split by retryability the way the supervisor
/// consumes them.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Worth retrying with backoff: connection loss, timeouts, upstream
    /// temporarily unavailable.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Retrying cannot help: protocol mismatch, authentication failure.
    #[error("permanent transport failure: {0}")]
    Permanent(String),

    /// The partition has no active stream to close.
    #[error("no active stream for partition {0}")]
    NoSuchStream(PartitionId),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// The upstream transport as the supervisor sees it.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a stream for one partition. Events flow to `observer` after an
    /// accepted open, starting with `stream_open`.
    async fn open_stream(
        &self,
        request: OpenStreamRequest,
        observer: std::sync::Arc<dyn StreamObserver>,
    ) -> std::result::Result<OpenOutcome, TransportError>;

    /// Close a partition's active stream. Idempotent from the supervisor's
    /// point of view; closing an unopened stream may report
    /// [`TransportError::NoSuchStream`].
    async fn close_stream(
        &self,
        partition: PartitionId,
    ) -> std::result::Result<(), TransportError>;

    /// The partition's current high seqno; used by the `FromNow` start
    /// policy.
    async fn latest_seqno(
        &self,
        partition: PartitionId,
    ) -> std::result::Result<u64, TransportError>;
}

/// The protocol callback set, invoked by the transport.
///
/// The unused collection-lifecycle and OSO callbacks default to no-ops:
/// this consumer does not subscribe to them, but their arrival must not
/// fail.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    async fn stream_open(&self, event: StreamOpenEvent);

    async fn snapshot_marker(&self, event: SnapshotEvent);

    async fn mutation(&self, event: MutationEvent);

    async fn deletion(&self, event: DeletionEvent);

    /// This consumer does not opt in to expirations; they arrive as
    /// deletions. An expiration callback is unexpected and is logged.
    async fn expiration(&self, partition: PartitionId, key: Bytes);

    async fn stream_end(&self, event: StreamEndEvent);

    async fn seqno_advanced(&self, event: SeqnoAdvancedEvent);

    /// Collection/scope create, delete, modify, and flush. Unused.
    async fn collection_changed(&self, _partition: PartitionId) {}

    /// Out-of-sequence-order snapshot boundary. Unused.
    async fn oso_snapshot(&self, _partition: PartitionId) {}
}
