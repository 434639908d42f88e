//! Checkpoint & Failover-Log Persistence
//!
//! The feed persists per-partition progress through the injected
//! [`CheckpointStore`] trait. Each partition owns one record: its
//! checkpoint plus its failover log. Writes are partitioned by `p`, and the
//! worker owning a partition is the only checkpoint writer, so
//! implementations never see colliding saves for the same partition.
//!
//! ## Monotonicity
//!
//! `save()` must be idempotent and monotonic in `last_seqno` per
//! `stream_uuid`: a save that would lower the persisted seqno under the
//! same stream history is silently ignored. A save under a *different*
//! history may lower it — that is a rollback.
//!
//! Two implementations ship in-crate:
//!
//! - [`MemoryCheckpointStore`] for tests and deployments that checkpoint
//!   elsewhere.
//! - [`FileCheckpointStore`]: one JSON record per partition, written with a
//!   temp-file + rename so a crashed save never corrupts the record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use dcpstream_core::{Checkpoint, FailoverEntry, FailoverLog, PartitionId};

use crate::error::{ClientError, Result};

/// Durable store for per-partition checkpoints and failover logs.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted checkpoint for the partition, if any.
    async fn load(&self, partition: PartitionId) -> Result<Option<Checkpoint>>;

    /// Persist a checkpoint. Idempotent; monotonic per stream history.
    async fn save(&self, partition: PartitionId, checkpoint: &Checkpoint) -> Result<()>;

    /// Overwrite the checkpoint unconditionally, bypassing the monotonic
    /// guard. Used by the supervisor's rollback path, which legitimately
    /// lowers the seqno under the same stream history.
    async fn truncate(&self, partition: PartitionId, checkpoint: &Checkpoint) -> Result<()>;

    /// Append a failover entry as the partition's latest history.
    async fn append_failover(&self, partition: PartitionId, entry: FailoverEntry) -> Result<()>;

    /// The partition's failover log, newest first.
    async fn failover_log(&self, partition: PartitionId) -> Result<FailoverLog>;

    /// Replace the partition's failover log with the server's accepted view.
    async fn replace_failover(&self, partition: PartitionId, log: FailoverLog) -> Result<()>;
}

/// One persisted record per partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PartitionRecord {
    checkpoint: Option<Checkpoint>,
    failover: FailoverLog,
}

fn keep_existing(existing: &Option<Checkpoint>, incoming: &Checkpoint) -> bool {
    match existing {
        Some(current) => {
            current.stream_uuid == incoming.stream_uuid && incoming.last_seqno < current.last_seqno
        }
        None => false,
    }
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<PartitionId, PartitionRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, the shape the feed builder expects.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, partition: PartitionId) -> Result<Option<Checkpoint>> {
        Ok(self
            .records
            .read()
            .await
            .get(&partition)
            .and_then(|r| r.checkpoint))
    }

    async fn save(&self, partition: PartitionId, checkpoint: &Checkpoint) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(partition).or_default();
        if keep_existing(&record.checkpoint, checkpoint) {
            return Ok(());
        }
        record.checkpoint = Some(*checkpoint);
        Ok(())
    }

    async fn truncate(&self, partition: PartitionId, checkpoint: &Checkpoint) -> Result<()> {
        let mut records = self.records.write().await;
        records.entry(partition).or_default().checkpoint = Some(*checkpoint);
        Ok(())
    }

    async fn append_failover(&self, partition: PartitionId, entry: FailoverEntry) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .entry(partition)
            .or_default()
            .failover
            .push_latest(entry);
        Ok(())
    }

    async fn failover_log(&self, partition: PartitionId) -> Result<FailoverLog> {
        Ok(self
            .records
            .read()
            .await
            .get(&partition)
            .map(|r| r.failover.clone())
            .unwrap_or_default())
    }

    async fn replace_failover(&self, partition: PartitionId, log: FailoverLog) -> Result<()> {
        let mut records = self.records.write().await;
        records.entry(partition).or_default().failover = log;
        Ok(())
    }
}

/// File-backed checkpoint store: one JSON record per partition under a
/// directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles for failover updates; checkpoint
    // saves are already single-writer per partition.
    records: RwLock<HashMap<PartitionId, PartitionRecord>>,
}

impl FileCheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed and
    /// loading any existing partition records.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ClientError::CheckpointStore(format!("create {:?}: {}", dir, e)))?;

        let mut records = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ClientError::CheckpointStore(format!("read {:?}: {}", dir, e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ClientError::CheckpointStore(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(partition) = Self::partition_for(&name.to_string_lossy()) else {
                continue;
            };
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| ClientError::CheckpointStore(e.to_string()))?;
            let record: PartitionRecord = serde_json::from_slice(&bytes).map_err(|e| {
                ClientError::CheckpointStore(format!("decode {:?}: {}", entry.path(), e))
            })?;
            records.insert(partition, record);
        }

        Ok(Self {
            dir,
            records: RwLock::new(records),
        })
    }

    fn path_for(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("partition-{:05}.json", partition))
    }

    fn partition_for(file_name: &str) -> Option<PartitionId> {
        file_name
            .strip_prefix("partition-")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    async fn persist(&self, partition: PartitionId, record: &PartitionRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| ClientError::CheckpointStore(e.to_string()))?;
        let path = self.path_for(partition);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ClientError::CheckpointStore(format!("write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ClientError::CheckpointStore(format!("rename {:?}: {}", path, e)))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, partition: PartitionId) -> Result<Option<Checkpoint>> {
        Ok(self
            .records
            .read()
            .await
            .get(&partition)
            .and_then(|r| r.checkpoint))
    }

    async fn save(&self, partition: PartitionId, checkpoint: &Checkpoint) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(partition).or_default();
        if keep_existing(&record.checkpoint, checkpoint) {
            return Ok(());
        }
        record.checkpoint = Some(*checkpoint);
        let snapshot = record.clone();
        drop(records);
        self.persist(partition, &snapshot).await
    }

    async fn truncate(&self, partition: PartitionId, checkpoint: &Checkpoint) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(partition).or_default();
        record.checkpoint = Some(*checkpoint);
        let snapshot = record.clone();
        drop(records);
        self.persist(partition, &snapshot).await
    }

    async fn append_failover(&self, partition: PartitionId, entry: FailoverEntry) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(partition).or_default();
        record.failover.push_latest(entry);
        let snapshot = record.clone();
        drop(records);
        self.persist(partition, &snapshot).await
    }

    async fn failover_log(&self, partition: PartitionId) -> Result<FailoverLog> {
        Ok(self
            .records
            .read()
            .await
            .get(&partition)
            .map(|r| r.failover.clone())
            .unwrap_or_default())
    }

    async fn replace_failover(&self, partition: PartitionId, log: FailoverLog) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(partition).or_default();
        record.failover = log;
        let snapshot = record.clone();
        drop(records);
        self.persist(partition, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ckpt(uuid: u64, seqno: u64) -> Checkpoint {
        Checkpoint {
            stream_uuid: uuid,
            last_seqno: seqno,
            snapshot_start: seqno,
            snapshot_end: seqno,
        }
    }

    // ---------------------------------------------------------------
    // Memory store
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_memory_load_missing() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_save_then_load() {
        let store = MemoryCheckpointStore::new();
        store.save(3, &ckpt(0xA, 10)).await.unwrap();
        assert_eq!(store.load(3).await.unwrap(), Some(ckpt(0xA, 10)));
        assert!(store.load(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_save_monotonic_per_uuid() {
        let store = MemoryCheckpointStore::new();
        store.save(0, &ckpt(0xA, 10)).await.unwrap();
        // Lower seqno under the same history is ignored.
        store.save(0, &ckpt(0xA, 5)).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(ckpt(0xA, 10)));
        // Idempotent re-save is fine.
        store.save(0, &ckpt(0xA, 10)).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(ckpt(0xA, 10)));
    }

    #[tokio::test]
    async fn test_memory_rollback_under_new_uuid_lowers_seqno() {
        let store = MemoryCheckpointStore::new();
        store.save(0, &ckpt(0xA, 100)).await.unwrap();
        store.save(0, &ckpt(0xB, 50)).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(ckpt(0xB, 50)));
    }

    #[tokio::test]
    async fn test_memory_truncate_bypasses_monotonic_guard() {
        let store = MemoryCheckpointStore::new();
        store.save(0, &ckpt(0xA, 100)).await.unwrap();
        // save() under the same history refuses to go backwards...
        store.save(0, &ckpt(0xA, 50)).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(ckpt(0xA, 100)));
        // ...truncate() is the explicit rollback path.
        store.truncate(0, &ckpt(0xA, 50)).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(ckpt(0xA, 50)));
    }

    #[tokio::test]
    async fn test_memory_failover_append_and_read() {
        let store = MemoryCheckpointStore::new();
        assert!(store.failover_log(0).await.unwrap().is_empty());

        store
            .append_failover(0, FailoverEntry::new(0xA, 100))
            .await
            .unwrap();
        store
            .append_failover(0, FailoverEntry::new(0xB, 200))
            .await
            .unwrap();

        let log = store.failover_log(0).await.unwrap();
        assert_eq!(log.latest(), Some(FailoverEntry::new(0xB, 200)));
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_replace_failover() {
        let store = MemoryCheckpointStore::new();
        store
            .append_failover(0, FailoverEntry::new(0xA, 100))
            .await
            .unwrap();
        let server = FailoverLog::new(vec![FailoverEntry::new(0xC, 40)]);
        store.replace_failover(0, server.clone()).await.unwrap();
        assert_eq!(store.failover_log(0).await.unwrap(), server);
    }

    #[tokio::test]
    async fn test_memory_partitions_are_independent() {
        let store = MemoryCheckpointStore::new();
        store.save(0, &ckpt(0xA, 1)).await.unwrap();
        store.save(1, &ckpt(0xB, 2)).await.unwrap();
        assert_eq!(store.load(0).await.unwrap().unwrap().stream_uuid, 0xA);
        assert_eq!(store.load(1).await.unwrap().unwrap().stream_uuid, 0xB);
    }

    // ---------------------------------------------------------------
    // File store
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save(7, &ckpt(0xA, 42)).await.unwrap();
        store
            .append_failover(7, FailoverEntry::new(0xA, 42))
            .await
            .unwrap();

        // Reopen from disk.
        let reopened = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load(7).await.unwrap(), Some(ckpt(0xA, 42)));
        assert_eq!(
            reopened.failover_log(7).await.unwrap().latest(),
            Some(FailoverEntry::new(0xA, 42))
        );
    }

    #[tokio::test]
    async fn test_file_store_monotonic_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.save(0, &ckpt(0xA, 10)).await.unwrap();
            store.save(0, &ckpt(0xA, 4)).await.unwrap();
        }
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(ckpt(0xA, 10)));
    }

    #[tokio::test]
    async fn test_file_store_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hi")
            .await
            .unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert!(store.load(0).await.unwrap().is_none());
    }

    #[test]
    fn test_partition_file_name_parsing() {
        assert_eq!(FileCheckpointStore::partition_for("partition-00007.json"), Some(7));
        assert_eq!(FileCheckpointStore::partition_for("partition-01023.json"), Some(1023));
        assert_eq!(FileCheckpointStore::partition_for("partition-.json"), None);
        assert_eq!(FileCheckpointStore::partition_for("other.json"), None);
    }
}
