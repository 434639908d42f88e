//! Stream Event Data Structures
//!
//! This module defines the events a change-feed stream carries for a single
//! partition, plus the outward `FeedEvent` form handed to downstream
//! consumers.
//!
//! ## Event flow
//!
//! ```text
//! transport callback → StreamEvent variant → partition worker → FeedEvent
//! ```
//!
//! ## Structure
//!
//! Every event identifies its partition and an optional stream tag
//! (`stream_id`) distinguishing concurrent streams over the same partition.
//! Within a partition, `seq` is strictly increasing across `Mutation`,
//! `Deletion`, and `SeqnoAdvanced`; `Snapshot` markers delimit runs of
//! events without consuming a seq themselves.
//!
//! ## Design Decisions
//!
//! - Keys and values use `bytes::Bytes` for zero-copy hand-off between the
//!   transport, the workers, and the downstream consumer.
//! - `FeedEvent` is stamped with a wall-clock `received_at` at conversion
//!   time, so downstream lag measurement does not depend on upstream clocks.
//! - Only mutations and deletions become feed events; snapshots, stream
//!   ends, and seqno advances are control-plane events consumed internally.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checkpoint::FailoverLog;

/// Identifier of an upstream partition. Fixed for the consumer lifetime.
pub type PartitionId = u16;

/// Snapshot marker classification.
///
/// The wire carries a bitmask; [`SnapshotType::from_raw`] decodes it to the
/// dominant flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotType {
    /// Snapshot assembled from in-memory state upstream.
    Memory,
    /// Snapshot backed by on-disk state upstream.
    Disk,
    /// Checkpoint-boundary snapshot.
    Checkpoint,
    /// Acknowledgement-required snapshot.
    Ack,
}

impl SnapshotType {
    const RAW_MEMORY: u32 = 0x01;
    const RAW_DISK: u32 = 0x02;
    const RAW_CHECKPOINT: u32 = 0x04;
    const RAW_ACK: u32 = 0x08;

    /// Decode a raw snapshot-marker flag word.
    ///
    /// Disk dominates memory when both bits are set; unknown bit patterns
    /// decode as `Memory`.
    pub fn from_raw(raw: u32) -> Self {
        if raw & Self::RAW_DISK != 0 {
            SnapshotType::Disk
        } else if raw & Self::RAW_MEMORY != 0 {
            SnapshotType::Memory
        } else if raw & Self::RAW_CHECKPOINT != 0 {
            SnapshotType::Checkpoint
        } else if raw & Self::RAW_ACK != 0 {
            SnapshotType::Ack
        } else {
            SnapshotType::Memory
        }
    }
}

/// Snapshot marker: delimits the half-open seq window containing the
/// mutations and deletions that follow it on the same partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEvent {
    pub partition: PartitionId,
    pub stream_id: u16,
    pub start_seq: u64,
    pub end_seq: u64,
    pub snapshot_type: SnapshotType,
}

/// A document mutation observed on a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub partition: PartitionId,
    pub stream_id: u16,
    pub seq: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: u8,
    pub collection: u32,
    pub key: Bytes,
    pub value: Bytes,
}

impl MutationEvent {
    /// Convert into the outward feed form, stamping the receive time.
    pub fn into_feed_event(self) -> FeedEvent {
        FeedEvent {
            opcode: FeedOpcode::Mutation,
            partition: self.partition,
            seq: self.seq,
            cas: self.cas,
            flags: self.flags,
            expiry: self.expiry,
            datatype: self.datatype,
            collection: self.collection,
            key: self.key,
            value: self.value,
            received_at: SystemTime::now(),
        }
    }
}

/// A document deletion observed on a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionEvent {
    pub partition: PartitionId,
    pub stream_id: u16,
    pub seq: u64,
    pub cas: u64,
    pub datatype: u8,
    pub collection: u32,
    pub key: Bytes,
    pub value: Bytes,
}

impl DeletionEvent {
    /// Convert into the outward feed form, stamping the receive time.
    pub fn into_feed_event(self) -> FeedEvent {
        FeedEvent {
            opcode: FeedOpcode::Deletion,
            partition: self.partition,
            seq: self.seq,
            cas: self.cas,
            flags: 0,
            expiry: 0,
            datatype: self.datatype,
            collection: self.collection,
            key: self.key,
            value: self.value,
            received_at: SystemTime::now(),
        }
    }
}

/// Emitted once per accepted stream open, ahead of any data events, carrying
/// the server's failover log for the new stream history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenEvent {
    pub partition: PartitionId,
    pub stream_id: u16,
    pub failover_log: FailoverLog,
}

/// Terminal event for a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndEvent {
    pub partition: PartitionId,
    pub stream_id: u16,
    pub reason: StreamEndReason,
}

/// Informational seqno advance: moves the high-watermark without delivering
/// a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnoAdvancedEvent {
    pub partition: PartitionId,
    pub stream_id: u16,
    pub seq: u64,
}

/// Why a partition stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The requested end seqno was reached; the partition is complete.
    Ok,
    /// The consumer closed the stream.
    Closed,
    /// Upstream partition state changed (e.g. ownership moved).
    StateChanged,
    /// The connection to the upstream dropped.
    Disconnected,
    /// The upstream requires the consumer to resume at a lower seqno.
    Rollback(u64),
    /// The upstream rejected the stream filter.
    Filter,
    /// The consumer fell too far behind the upstream's retention window.
    TooSlow,
    /// Any reason the consumer does not recognize.
    Unknown(String),
}

impl fmt::Display for StreamEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEndReason::Ok => write!(f, "ok"),
            StreamEndReason::Closed => write!(f, "closed"),
            StreamEndReason::StateChanged => write!(f, "state_changed"),
            StreamEndReason::Disconnected => write!(f, "disconnected"),
            StreamEndReason::Rollback(seq) => write!(f, "rollback({})", seq),
            StreamEndReason::Filter => write!(f, "filter"),
            StreamEndReason::TooSlow => write!(f, "too_slow"),
            StreamEndReason::Unknown(s) => write!(f, "unknown({})", s),
        }
    }
}

/// The internal event union routed from the transport observer to the
/// partition workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened(StreamOpenEvent),
    Snapshot(SnapshotEvent),
    Mutation(MutationEvent),
    Deletion(DeletionEvent),
    SeqnoAdvanced(SeqnoAdvancedEvent),
    End(StreamEndEvent),
}

impl StreamEvent {
    /// The partition this event belongs to.
    pub fn partition(&self) -> PartitionId {
        match self {
            StreamEvent::Opened(e) => e.partition,
            StreamEvent::Snapshot(e) => e.partition,
            StreamEvent::Mutation(e) => e.partition,
            StreamEvent::Deletion(e) => e.partition,
            StreamEvent::SeqnoAdvanced(e) => e.partition,
            StreamEvent::End(e) => e.partition,
        }
    }

    /// Stable lowercase label for metrics and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Opened(_) => "opened",
            StreamEvent::Snapshot(_) => "snapshot",
            StreamEvent::Mutation(_) => "mutation",
            StreamEvent::Deletion(_) => "deletion",
            StreamEvent::SeqnoAdvanced(_) => "seqno_advanced",
            StreamEvent::End(_) => "stream_end",
        }
    }
}

/// Operation carried by a feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedOpcode {
    Mutation,
    Deletion,
}

impl fmt::Display for FeedOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedOpcode::Mutation => write!(f, "mutation"),
            FeedOpcode::Deletion => write!(f, "deletion"),
        }
    }
}

/// The outward, consolidated representation of a mutation or deletion
/// delivered to downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub opcode: FeedOpcode,
    pub partition: PartitionId,
    pub seq: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: u8,
    pub collection: u32,
    pub key: Bytes,
    pub value: Bytes,
    /// When this consumer received the event, not when upstream produced it.
    pub received_at: SystemTime,
}
