//! Error types for the change-feed client.
//!
//! ## Error Handling Strategy
//!
//! - **Retriable**: transient [`TransportError`]s and open timeouts are
//!   handled by the supervisor's backoff/restart loop and normally never
//!   reach the caller.
//! - **Per-partition fatal**: [`ClientError::Protocol`] invariant
//!   violations and exhausted restart budgets abandon one partition; the
//!   feed stays open and the condition is visible via `Feed::status()`.
//! - **Feed fatal**: configuration errors and unrecoverable checkpoint
//!   store failures surface from `FeedBuilder::build()` / `Feed::close()`.

use std::time::Duration;

use thiserror::Error;

use dcpstream_core::PartitionId;

use crate::transport::TransportError;

/// Convenience alias used throughout the client.
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid feed configuration (missing transport/store, bad bounds).
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport failed to open, close, or serve a stream.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The checkpoint store failed to load or persist partition state.
    #[error("checkpoint store error: {0}")]
    CheckpointStore(String),

    /// A per-partition protocol invariant was violated.
    #[error("protocol error: {0}")]
    Protocol(#[from] dcpstream_core::Error),

    /// A partition exhausted its restart budget and was abandoned.
    #[error("partition {0} abandoned after {1} restart attempts")]
    Abandoned(PartitionId, u32),

    /// A stream open did not complete within the configured timeout.
    #[error("stream open timed out after {0:?}")]
    OpenTimeout(Duration),

    /// The initial open barrier did not reach the configured quorum.
    #[error("only {opened} of {required} required partitions opened")]
    QuorumNotReached { opened: usize, required: usize },

    /// The feed has been closed.
    #[error("feed is closed")]
    Closed,

    /// A bug or unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}
