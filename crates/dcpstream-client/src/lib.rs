//! dcpstream-client: a partitioned change-feed stream consumer.
//!
//! Subscribes to a partitioned change protocol upstream, routes
//! per-partition mutation/deletion/snapshot events through a pool of
//! ordered workers, filters them, and materializes them as a unified feed
//! with acknowledgement-gated, resumable checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! transport ──► EventRouter ──► worker inboxes ──► workers ──► Feed
//!     ▲           (filter)      (bounded, FIFO      │            │
//!     │                          per partition)     │ checkpoints│ acks
//!     │                                             ▼            ▼
//!     └── Supervisor ◄── stream-end notices    CheckpointStore  AckTable
//!         (open / reopen / rollback / abandon)
//! ```
//!
//! Per-partition ordering is strict; cross-partition ordering is not
//! guaranteed. Delivery is at-least-once: events delivered but not
//! acknowledged before a restart are redelivered from the checkpoint.
//!
//! The upstream protocol library is abstracted behind
//! [`transport::StreamTransport`] and invokes the feed through the
//! [`transport::StreamObserver`] callback set; checkpoint persistence is
//! abstracted behind [`store::CheckpointStore`].

pub mod backoff;
pub mod config;
pub mod error;
pub mod feed;
pub mod filter;
pub mod metrics;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod testing;
pub mod transport;

mod observer;
mod supervisor;
mod worker;

pub use backoff::BackoffPolicy;
pub use config::{FeedConfig, StartPolicy};
pub use error::{ClientError, Result};
pub use feed::{Feed, FeedBuilder};
pub use filter::{KeyFilter, NoFilter, PrefixFilter};
pub use status::{FeedStatus, PartitionState, PartitionStatus};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use transport::{
    OpenOutcome, OpenStreamRequest, StreamObserver, StreamTransport, TransportError, SEQNO_MAX,
};

pub use dcpstream_core::{
    Checkpoint, FailoverEntry, FailoverLog, FeedEvent, FeedOpcode, PartitionId, StreamEndReason,
};
