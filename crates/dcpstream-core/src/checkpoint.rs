//! Checkpoints and Failover Logs
//!
//! Per-partition resume state for the change-feed consumer.
//!
//! A [`Checkpoint`] records how far a partition has been processed and the
//! snapshot window that was in force, keyed by the stream history
//! (`stream_uuid`) it was observed under. A [`FailoverLog`] records the
//! sequence of stream histories the upstream has reported for a partition;
//! comparing the local log against the server's detects forked histories
//! and yields the rollback point.
//!
//! ## Invariants
//!
//! - `snapshot_start ≤ last_seqno ≤ snapshot_end` for every checkpoint.
//! - Failover logs are ordered newest-first and append-only: a new entry is
//!   pushed on each accepted stream open.
//! - An entry `(uuid, seqno)` means "history `uuid` is valid up to `seqno`".

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One entry of a partition's failover log: a stream history identity and
/// the highest seqno known valid under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seqno: u64,
}

impl FailoverEntry {
    pub fn new(uuid: u64, seqno: u64) -> Self {
        Self { uuid, seqno }
    }
}

/// Per-partition failover log, newest entry first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverLog {
    entries: Vec<FailoverEntry>,
}

impl FailoverLog {
    /// Build a log from entries already ordered newest-first.
    pub fn new(entries: Vec<FailoverEntry>) -> Self {
        Self { entries }
    }

    /// The current stream history, if any.
    pub fn latest(&self) -> Option<FailoverEntry> {
        self.entries.first().copied()
    }

    /// All entries, newest first.
    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append a new history as the latest entry.
    ///
    /// A re-open under the unchanged history is deduplicated: if the latest
    /// entry already carries the same uuid its seqno is raised instead.
    pub fn push_latest(&mut self, entry: FailoverEntry) {
        match self.entries.first_mut() {
            Some(latest) if latest.uuid == entry.uuid => {
                latest.seqno = latest.seqno.max(entry.seqno);
            }
            _ => self.entries.insert(0, entry),
        }
    }

    /// The entry whose history contains `seqno`: the oldest entry still
    /// valid at or beyond it.
    pub fn entry_containing(&self, seqno: u64) -> Option<FailoverEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.seqno >= seqno)
            .copied()
    }

    /// The most recent point the local and server histories agree on.
    ///
    /// For every uuid both logs share, the common reach is the smaller of
    /// the two seqnos; the ancestor is the shared uuid with the greatest
    /// common reach. `None` means the histories share nothing and the
    /// partition must restart from zero.
    pub fn common_ancestor(&self, server: &FailoverLog) -> Option<FailoverEntry> {
        let mut best: Option<FailoverEntry> = None;
        for local in &self.entries {
            for remote in server.entries() {
                if local.uuid == remote.uuid {
                    let seqno = local.seqno.min(remote.seqno);
                    if best.map_or(true, |b| seqno > b.seqno) {
                        best = Some(FailoverEntry::new(local.uuid, seqno));
                    }
                }
            }
        }
        best
    }
}

/// Durable per-partition progress marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stream history the progress was observed under.
    pub stream_uuid: u64,
    /// Highest seqno handed to (and acknowledged by) the downstream sink.
    pub last_seqno: u64,
    /// Snapshot window in force when the checkpoint was taken.
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

impl Checkpoint {
    /// Construct a checkpoint, validating the window invariant.
    pub fn new(
        stream_uuid: u64,
        last_seqno: u64,
        snapshot_start: u64,
        snapshot_end: u64,
    ) -> Result<Self> {
        let ckpt = Self {
            stream_uuid,
            last_seqno,
            snapshot_start,
            snapshot_end,
        };
        if !ckpt.is_valid() {
            return Err(Error::CheckpointInvariant {
                last_seqno,
                snapshot_start,
                snapshot_end,
            });
        }
        Ok(ckpt)
    }

    /// Whether `snapshot_start ≤ last_seqno ≤ snapshot_end` holds.
    pub fn is_valid(&self) -> bool {
        self.snapshot_start <= self.last_seqno && self.last_seqno <= self.snapshot_end
    }

    /// Truncate to a rollback point under a (possibly different) history.
    ///
    /// The snapshot window collapses to the rollback seqno; the next
    /// accepted snapshot marker re-establishes a real window.
    pub fn rollback_to(stream_uuid: u64, seqno: u64) -> Self {
        Self {
            stream_uuid,
            last_seqno: seqno,
            snapshot_start: seqno,
            snapshot_end: seqno,
        }
    }
}
