//! Protocol Invariant Errors
//!
//! Violations of the per-partition stream protocol. Each of these is fatal
//! for the affected partition only: the worker that detects one halts that
//! partition and surfaces the error through the feed's status, while other
//! partitions continue.

use thiserror::Error;

use crate::event::PartitionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("partition {partition}: seqno {seq} does not advance past {current}")]
    SeqnoRegression {
        partition: PartitionId,
        seq: u64,
        current: u64,
    },

    #[error("partition {partition}: seqno {seq} outside snapshot window {start}..={end}")]
    SeqnoOutsideSnapshot {
        partition: PartitionId,
        seq: u64,
        start: u64,
        end: u64,
    },

    #[error("partition {partition}: inverted snapshot window {start}..={end}")]
    SnapshotInversion {
        partition: PartitionId,
        start: u64,
        end: u64,
    },

    #[error(
        "checkpoint invariant violated: snapshot_start {snapshot_start} <= last_seqno {last_seqno} <= snapshot_end {snapshot_end}"
    )]
    CheckpointInvariant {
        last_seqno: u64,
        snapshot_start: u64,
        snapshot_end: u64,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
