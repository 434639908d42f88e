pub mod checkpoint;
pub mod error;
pub mod event;

pub use checkpoint::{Checkpoint, FailoverEntry, FailoverLog};
pub use error::{Error, Result};
pub use event::{
    DeletionEvent, FeedEvent, FeedOpcode, MutationEvent, PartitionId, SeqnoAdvancedEvent,
    SnapshotEvent, SnapshotType, StreamEndEvent, StreamEndReason, StreamEvent, StreamOpenEvent,
};
