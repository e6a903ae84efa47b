use crate::chunk::{record_id, Chunk, ChunkRecord};
use crate::config::ChunkStoreSettings;
use crate::error::RecorderError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const PAYLOAD_EXT: &str = "chunk";
const RECORD_EXT: &str = "json";

/// Local persistent store for spilled chunks, keyed by recording id and timestamp.
/// There is no locking across callers: a flush and a cleanup sweep must not run
/// against the same recording concurrently.
#[async_trait]
pub trait ChunkStore {
    /// Persist one chunk of `recording_id`
    async fn put(&self, recording_id: &str, chunk: &Chunk) -> Result<(), RecorderError>;

    /// All persisted chunks of `recording_id`, in timestamp order
    async fn list(&self, recording_id: &str) -> Result<Vec<Chunk>, RecorderError>;

    /// Remove every chunk of `recording_id`, returns how many were removed
    async fn delete_recording(&self, recording_id: &str) -> Result<usize, RecorderError>;

    /// Remove chunks of any recording with a timestamp strictly below `cutoff` (ms)
    async fn delete_older_than(&self, cutoff: i64) -> Result<usize, RecorderError>;
}

pub fn create_store(
    settings: &ChunkStoreSettings,
) -> Result<Arc<dyn ChunkStore + Send + Sync>, RecorderError> {
    match settings {
        ChunkStoreSettings::Fs { path } => {
            if path.trim().is_empty() {
                return Err(RecorderError::ConfigError(
                    "chunk store path is empty".to_string(),
                ));
            }
            info!("chunk store: filesystem at {}", path);
            Ok(Arc::new(FileChunkStore::new(path.clone())))
        }
        ChunkStoreSettings::Memory { quota } => {
            if *quota == Some(0) {
                return Err(RecorderError::ConfigError(
                    "chunk store quota must be positive".to_string(),
                ));
            }
            info!("chunk store: memory, quota {:?}", quota);
            Ok(Arc::new(MemoryChunkStore::with_quota(*quota)))
        }
    }
}

fn validate_recording_id(recording_id: &str) -> Result<(), RecorderError> {
    if recording_id.is_empty()
        || recording_id.contains("..")
        || recording_id.contains('/')
        || recording_id.contains('\\')
    {
        return Err(RecorderError::InvalidRecordingId(recording_id.to_string()));
    }

    Ok(())
}

/// Chunk store on the local filesystem.
/// Layout: `<base>/<recording_id>/<timestamp>.chunk` plus a `<timestamp>.json` record.
#[derive(Debug, Clone)]
pub struct FileChunkStore {
    base_path: Arc<PathBuf>,
}

impl FileChunkStore {
    pub fn new(path: String) -> Self {
        let base_path = PathBuf::from(path);
        Self {
            base_path: Arc::new(base_path),
        }
    }

    fn recording_dir(&self, recording_id: &str) -> Result<PathBuf, RecorderError> {
        validate_recording_id(recording_id)?;
        Ok(self.base_path.join(recording_id))
    }

    async fn read_records(dir: &Path) -> Result<Vec<ChunkRecord>, RecorderError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RecorderError::StorageError(format!(
                    "Failed to read directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecorderError::StorageError(format!("Failed to list chunks: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }

            let content = tokio::fs::read(&path).await.map_err(|e| {
                RecorderError::StorageError(format!(
                    "Failed to read record {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let record: ChunkRecord = serde_json::from_slice(&content).map_err(|e| {
                RecorderError::StorageError(format!(
                    "Failed to deserialize record {}: {}",
                    path.display(),
                    e
                ))
            })?;
            records.push(record);
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    /// Remove every file of `dir` whose timestamp name is below `cutoff`,
    /// whether or not its record is readable. Returns the number of chunks
    /// removed and drops the directory once nothing is left in it.
    async fn sweep_dir(dir: &Path, cutoff: i64) -> Result<usize, RecorderError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            RecorderError::StorageError(format!(
                "Failed to read directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut removed = BTreeSet::new();
        let mut kept = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecorderError::StorageError(format!("Failed to list chunks: {}", e)))?
        {
            let path = entry.path();
            let timestamp = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok());
            let Some(timestamp) = timestamp.filter(|t| *t < cutoff) else {
                kept += 1;
                continue;
            };

            match tokio::fs::remove_file(&path).await {
                Ok(_) => {
                    removed.insert(timestamp);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    kept += 1;
                }
            }
        }

        if kept == 0 {
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                warn!("Failed to remove empty directory {}: {}", dir.display(), e);
            }
        }

        Ok(removed.len())
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn put(&self, recording_id: &str, chunk: &Chunk) -> Result<(), RecorderError> {
        let dir = self.recording_dir(recording_id)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            error!("Failed to create directory {}: {}", dir.display(), e);
            RecorderError::StorageError(format!("Failed to create directory: {}", e))
        })?;

        // Payload first: a record without its payload is never listed as complete
        let payload_path = dir.join(format!("{}.{}", chunk.timestamp, PAYLOAD_EXT));
        tokio::fs::write(&payload_path, &chunk.payload)
            .await
            .map_err(|e| {
                error!("Failed to write chunk {}: {}", payload_path.display(), e);
                RecorderError::StorageError(format!("Failed to write chunk: {}", e))
            })?;

        let record = ChunkRecord::new(recording_id, chunk);
        let json = serde_json::to_vec(&record).map_err(|e| {
            RecorderError::StorageError(format!("Failed to serialize record: {}", e))
        })?;
        let record_path = dir.join(format!("{}.{}", chunk.timestamp, RECORD_EXT));
        tokio::fs::write(&record_path, json).await.map_err(|e| {
            error!("Failed to write record {}: {}", record_path.display(), e);
            RecorderError::StorageError(format!("Failed to write record: {}", e))
        })?;

        debug!("Persisted chunk {}", record.id);
        Ok(())
    }

    async fn list(&self, recording_id: &str) -> Result<Vec<Chunk>, RecorderError> {
        let dir = self.recording_dir(recording_id)?;
        let records = Self::read_records(&dir).await?;

        let mut chunks = Vec::with_capacity(records.len());
        for record in records {
            let path = dir.join(format!("{}.{}", record.timestamp, PAYLOAD_EXT));
            let payload = tokio::fs::read(&path).await.map_err(|e| {
                RecorderError::StorageError(format!(
                    "Failed to read chunk {}: {}",
                    path.display(),
                    e
                ))
            })?;
            chunks.push(record.into_chunk(Bytes::from(payload)));
        }

        Ok(chunks)
    }

    async fn delete_recording(&self, recording_id: &str) -> Result<usize, RecorderError> {
        let dir = self.recording_dir(recording_id)?;
        let records = Self::read_records(&dir).await?;
        let removed = records.len();

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RecorderError::StorageError(format!(
                    "Failed to remove directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        }

        debug!("Removed {} chunks of recording {}", removed, recording_id);
        Ok(removed)
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<usize, RecorderError> {
        let mut entries = match tokio::fs::read_dir(self.base_path.as_path()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(RecorderError::StorageError(format!(
                    "Failed to read directory {}: {}",
                    self.base_path.display(),
                    e
                )))
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecorderError::StorageError(format!("Failed to list recordings: {}", e)))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }

            let dir = entry.path();
            match Self::sweep_dir(&dir, cutoff).await {
                Ok(n) => removed += n,
                Err(e) => warn!("Skipping {} during sweep: {}", dir.display(), e),
            }
        }

        Ok(removed)
    }
}

/// Chunk store kept in process memory. An optional quota turns writes that
/// would exceed it into `QuotaExceeded` errors; the store can also be switched
/// off to behave like unavailable storage.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    quota: Option<u64>,
    unavailable: AtomicBool,
    records: Mutex<BTreeMap<(String, i64), Chunk>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: Option<u64>) -> Self {
        Self {
            quota,
            ..Self::default()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.records.lock().values().map(|c| c.size as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn check_available(&self) -> Result<(), RecorderError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(RecorderError::StorageError(
                "local storage unavailable".to_string(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, recording_id: &str, chunk: &Chunk) -> Result<(), RecorderError> {
        self.check_available()?;
        validate_recording_id(recording_id)?;

        let mut records = self.records.lock();
        if let Some(quota) = self.quota {
            let used: u64 = records.values().map(|c| c.size as u64).sum();
            if used + chunk.size as u64 > quota {
                return Err(RecorderError::QuotaExceeded(format!(
                    "{} bytes used of {}, cannot store {}",
                    used,
                    quota,
                    record_id(recording_id, chunk.timestamp)
                )));
            }
        }

        records.insert((recording_id.to_string(), chunk.timestamp), chunk.clone());
        Ok(())
    }

    async fn list(&self, recording_id: &str) -> Result<Vec<Chunk>, RecorderError> {
        self.check_available()?;

        let records = self.records.lock();
        Ok(records
            .iter()
            .filter(|((id, _), _)| id == recording_id)
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn delete_recording(&self, recording_id: &str) -> Result<usize, RecorderError> {
        self.check_available()?;

        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(id, _), _| id != recording_id);
        Ok(before - records.len())
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<usize, RecorderError> {
        self.check_available()?;

        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(_, timestamp), _| *timestamp >= cutoff);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunk(timestamp: i64, size: usize) -> Chunk {
        Chunk::new(Bytes::from(vec![7u8; size]), timestamp, Duration::from_millis(0))
    }

    fn file_store() -> (tempfile::TempDir, FileChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::new(dir.path().to_string_lossy().to_string());
        (dir, store)
    }

    #[tokio::test]
    async fn create_store_rejects_unusable_settings() {
        let empty = ChunkStoreSettings::Fs {
            path: " ".to_string(),
        };
        assert!(matches!(
            create_store(&empty),
            Err(RecorderError::ConfigError(_))
        ));
        let zero = ChunkStoreSettings::Memory { quota: Some(0) };
        assert!(matches!(
            create_store(&zero),
            Err(RecorderError::ConfigError(_))
        ));

        let store = create_store(&ChunkStoreSettings::Memory { quota: None }).unwrap();
        store.put("rec", &chunk(1, 4)).await.unwrap();
        assert_eq!(store.list("rec").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_lists_in_timestamp_order() {
        let (_dir, store) = file_store();
        store.put("rec", &chunk(30, 3)).await.unwrap();
        store.put("rec", &chunk(10, 1)).await.unwrap();
        store.put("rec", &chunk(20, 2)).await.unwrap();
        store.put("other", &chunk(15, 5)).await.unwrap();

        let chunks = store.list("rec").await.unwrap();
        let timestamps: Vec<i64> = chunks.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert_eq!(chunks[2].size, 3);
    }

    #[tokio::test]
    async fn file_store_missing_recording_is_empty() {
        let (_dir, store) = file_store();
        assert!(store.list("nothing").await.unwrap().is_empty());
        assert_eq!(store.delete_recording("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let (_dir, store) = file_store();
        assert!(matches!(
            store.put("../escape", &chunk(1, 1)).await,
            Err(RecorderError::InvalidRecordingId(_))
        ));
        assert!(store.list("a/b").await.is_err());
        assert!(store.list("").await.is_err());
    }

    #[tokio::test]
    async fn file_store_delete_recording() {
        let (dir, store) = file_store();
        store.put("rec", &chunk(1, 1)).await.unwrap();
        store.put("rec", &chunk(2, 1)).await.unwrap();

        assert_eq!(store.delete_recording("rec").await.unwrap(), 2);
        assert!(store.list("rec").await.unwrap().is_empty());
        assert!(!dir.path().join("rec").exists());
    }

    #[tokio::test]
    async fn file_store_sweep_removes_old_chunks_across_recordings() {
        let (dir, store) = file_store();
        store.put("old", &chunk(100, 1)).await.unwrap();
        store.put("old", &chunk(200, 1)).await.unwrap();
        store.put("mixed", &chunk(150, 1)).await.unwrap();
        store.put("mixed", &chunk(5_000, 1)).await.unwrap();

        assert_eq!(store.delete_older_than(1_000).await.unwrap(), 3);
        assert!(!dir.path().join("old").exists());

        let left = store.list("mixed").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 5_000);
    }

    #[tokio::test]
    async fn file_store_sweep_skips_over_broken_records() {
        let (dir, store) = file_store();
        store.put("abandoned", &chunk(100, 1)).await.unwrap();
        store.put("crashed", &chunk(50, 1)).await.unwrap();
        std::fs::write(dir.path().join("crashed").join("50.json"), b"{\"id\":").unwrap();

        assert_eq!(store.delete_older_than(1_000).await.unwrap(), 2);
        assert!(store.list("abandoned").await.unwrap().is_empty());
        assert!(!dir.path().join("crashed").exists());
    }

    #[tokio::test]
    async fn file_store_sweep_removes_payloads_without_record() {
        let (dir, store) = file_store();
        store.put("rec", &chunk(5_000, 1)).await.unwrap();
        std::fs::write(dir.path().join("rec").join("70.chunk"), b"orphan").unwrap();

        assert_eq!(store.delete_older_than(1_000).await.unwrap(), 1);
        assert!(!dir.path().join("rec").join("70.chunk").exists());
        assert_eq!(store.list("rec").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_quota() {
        let store = MemoryChunkStore::with_quota(Some(10));
        store.put("rec", &chunk(1, 6)).await.unwrap();
        let res = store.put("rec", &chunk(2, 6)).await;
        assert!(matches!(res, Err(RecorderError::QuotaExceeded(_))));
        assert_eq!(store.used(), 6);
    }

    #[tokio::test]
    async fn memory_store_unavailable() {
        let store = MemoryChunkStore::new();
        store.put("rec", &chunk(1, 1)).await.unwrap();
        store.set_available(false);
        assert!(store.list("rec").await.is_err());
        assert!(store.put("rec", &chunk(2, 1)).await.is_err());
        store.set_available(true);
        assert_eq!(store.list("rec").await.unwrap().len(), 1);
    }
}
