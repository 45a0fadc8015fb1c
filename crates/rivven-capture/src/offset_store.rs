//! Persisted partition state
//!
//! Offsets are committed here only after the consumer has acknowledged the
//! records they belong to, and loaded once at startup.
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemoryOffsetStore` | Testing, ephemeral capture |
//! | `FileOffsetStore` | Single-node production |
//!
//! The file store keeps one JSON document per partition:
//!
//! ```text
//! offsets_dir/
//!   server1.json   {"partition":{"server":"server1"},"offset":{...},"incremental":{...}}
//! ```

use crate::error::{CaptureError, Result};
use crate::event::Partition;
use crate::offset::PartitionState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage backend for committed partition state.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Last committed state of `partition`, if any.
    async fn load(&self, partition: &Partition) -> Result<Option<PartitionState>>;

    /// Persist `state` as the committed state of `partition`.
    async fn commit(&self, partition: &Partition, state: &PartitionState) -> Result<()>;
}

/// In-memory offset store (for testing or when persistence isn't needed).
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    states: RwLock<HashMap<Partition, PartitionState>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one partition.
    pub fn with_state(partition: Partition, state: PartitionState) -> Self {
        let mut states = HashMap::new();
        states.insert(partition, state);
        Self {
            states: RwLock::new(states),
        }
    }

    pub async fn get(&self, partition: &Partition) -> Option<PartitionState> {
        self.states.read().await.get(partition).cloned()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, partition: &Partition) -> Result<Option<PartitionState>> {
        Ok(self.get(partition).await)
    }

    async fn commit(&self, partition: &Partition, state: &PartitionState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(partition.clone(), state.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPartition {
    partition: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    state: PartitionState,
}

/// File-based offset store.
///
/// Writes go to a temp file which is synced and then renamed over the
/// partition's file, so a crash leaves either the old or the new state.
pub struct FileOffsetStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, PartitionState>>,
    fsync: bool,
}

impl FileOffsetStore {
    /// Open a store in `dir`, creating the directory if needed.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(dir, true).await
    }

    pub async fn with_options(dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let store = Self {
            dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key(partition: &Partition) -> Result<&str> {
        let key = partition.server_name.as_str();
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(CaptureError::config(format!(
                "server name '{}' cannot be used as an offset file name",
                key
            )));
        }
        Ok(key)
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut cache = self.cache.write().await;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<StoredPartition>(&content) {
                    Ok(stored) => {
                        cache.insert(key, stored.state);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to parse offset file"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read offset file"),
            }
        }

        if !cache.is_empty() {
            info!(partitions = cache.len(), dir = %self.dir.display(), "Loaded committed offsets");
        }
        Ok(())
    }

    /// Forget the committed state of `partition` (forces a fresh start).
    pub async fn delete(&self, partition: &Partition) -> Result<()> {
        let key = Self::key(partition)?;
        let path = self.file_path(key);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        self.cache.write().await.remove(key);
        info!(partition = %partition, "Deleted committed offset");
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, partition: &Partition) -> Result<Option<PartitionState>> {
        let key = Self::key(partition)?;
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn commit(&self, partition: &Partition, state: &PartitionState) -> Result<()> {
        let key = Self::key(partition)?;
        let path = self.file_path(key);
        let temp_path = path.with_extension("json.tmp");

        let stored = StoredPartition {
            partition: partition.source_partition(),
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&stored)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);
        fs::rename(&temp_path, &path).await?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), state.clone());
        debug!(partition = %partition, offset = %state.offset, "Committed offset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TableId;
    use crate::incremental_snapshot::IncrementalCursor;
    use crate::offset::{GtidOffset, LogPosition, Offset};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn state() -> PartitionState {
        let mut cursor = IncrementalCursor::new(vec![TableId::new("db", "orders")]);
        cursor.last_key = Some(json!({"id": 9_007_199_254_740_993u64}));
        PartitionState::new(Offset::Gtid(GtidOffset {
            gtids: "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-77,4e11fa47-71ca-11e1-9e33-c80aa9429562:5"
                .parse()
                .unwrap(),
            position: LogPosition::new("mysql-bin.000042", 18_446_744_073_709_551_000).with_row(3),
        }))
        .with_incremental(Some(cursor))
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryOffsetStore::new();
        let partition = Partition::new("s1", "db");
        assert!(store.load(&partition).await.unwrap().is_none());
        store.commit(&partition, &state()).await.unwrap();
        assert_eq!(store.load(&partition).await.unwrap(), Some(state()));
    }

    #[tokio::test]
    async fn test_file_store_round_trips_exactly_across_reopen() {
        let dir = tempdir().unwrap();
        let partition = Partition::new("server1", "inventory");
        {
            let store = FileOffsetStore::new(dir.path()).await.unwrap();
            store.commit(&partition, &state()).await.unwrap();
        }

        let store = FileOffsetStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load(&partition).await.unwrap(), Some(state()));

        let raw = std::fs::read_to_string(dir.path().join("server1.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["partition"], json!({"server": "server1"}));
        assert_eq!(value["offset"]["kind"], json!("gtid"));
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let dir = tempdir().unwrap();
        let partition = Partition::new("server1", "inventory");
        let store = FileOffsetStore::with_options(dir.path(), false).await.unwrap();
        store.commit(&partition, &state()).await.unwrap();
        store.delete(&partition).await.unwrap();
        assert!(store.load(&partition).await.unwrap().is_none());
        assert!(!dir.path().join("server1.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_unsafe_names() {
        let dir = tempdir().unwrap();
        let store = FileOffsetStore::new(dir.path()).await.unwrap();
        let err = store
            .load(&Partition::new("../escape", "db"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
    }
}
