use crate::chunk::{Chunk, MediaBlob};
use crate::config::BufferSettings;
use crate::error::RecorderError;
use crate::storage::ChunkStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Near-limit is reached at 4/5 of either configured maximum
const NEAR_LIMIT_NUMERATOR: u128 = 4;
const NEAR_LIMIT_DENOMINATOR: u128 = 5;

/// Aggregate view of the in-memory part of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStats {
    /// Sum of in-memory chunk sizes; spilled chunks are not re-scanned
    pub total_size: u64,
    /// Wall-clock time since the buffer was initialized
    pub duration: Duration,
    pub chunk_count: usize,
    pub is_near_limit: bool,
    /// Chunks and bytes moved to the chunk store during this session
    pub spilled_chunks: usize,
    pub spilled_size: u64,
}

/// `true` once `size` or `elapsed` reaches 80% of its configured maximum.
pub fn near_limit(size: u64, elapsed: Duration, settings: &BufferSettings) -> bool {
    let size_hit = size as u128 * NEAR_LIMIT_DENOMINATOR
        >= settings.max_size as u128 * NEAR_LIMIT_NUMERATOR;
    let duration_hit = elapsed.as_millis() * NEAR_LIMIT_DENOMINATOR
        >= settings.max_duration.as_millis() * NEAR_LIMIT_NUMERATOR;
    size_hit || duration_hit
}

/// Accumulates the chunks of one recording and spills them to a [`ChunkStore`]
/// before memory grows past the configured limits. A chunk is never rejected.
pub struct ChunkBuffer {
    recording_id: String,
    settings: BufferSettings,
    store: Arc<dyn ChunkStore + Send + Sync>,
    chunks: Vec<Chunk>,
    start: Instant,
    last_timestamp: Option<i64>,
    spilled_chunks: usize,
    spilled_size: u64,
}

impl ChunkBuffer {
    pub fn new(
        recording_id: &str,
        settings: BufferSettings,
        store: Arc<dyn ChunkStore + Send + Sync>,
    ) -> Self {
        Self {
            recording_id: recording_id.to_string(),
            settings,
            store,
            chunks: Vec::new(),
            start: Instant::now(),
            last_timestamp: None,
            spilled_chunks: 0,
            spilled_size: 0,
        }
    }

    pub fn recording_id(&self) -> &str {
        &self.recording_id
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    /// Reset the in-memory session and restart the duration clock.
    pub fn initialize(&mut self) {
        self.chunks.clear();
        self.start = Instant::now();
        self.spilled_chunks = 0;
        self.spilled_size = 0;
        info!("Recording buffer initialized: {}", self.recording_id);
    }

    /// Append a chunk stamped with the current time. With auto flush enabled the
    /// in-memory chunks are spilled as soon as the buffer is near its limits;
    /// a failing spill is returned to the caller.
    pub async fn add_chunk(&mut self, payload: Bytes) -> Result<(), RecorderError> {
        let chunk = Chunk::new(payload, self.next_timestamp(), self.start.elapsed());
        debug!(
            "Chunk added to {}: {} bytes at {:?}",
            self.recording_id, chunk.size, chunk.duration
        );
        self.chunks.push(chunk);

        if self.settings.auto_flush && self.is_near_limit() {
            info!(
                "Recording {} is near its limits, spilling {} chunks",
                self.recording_id,
                self.chunks.len()
            );
            self.flush_to_local_storage().await?;
        }

        Ok(())
    }

    // Persisted chunks are keyed by timestamp, so timestamps must strictly increase.
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    fn memory_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    pub fn stats(&self) -> BufferStats {
        let total_size = self.memory_size();
        let duration = self.start.elapsed();
        BufferStats {
            total_size,
            duration,
            chunk_count: self.chunks.len(),
            is_near_limit: near_limit(total_size, duration, &self.settings),
            spilled_chunks: self.spilled_chunks,
            spilled_size: self.spilled_size,
        }
    }

    pub fn is_near_limit(&self) -> bool {
        near_limit(self.memory_size(), self.start.elapsed(), &self.settings)
    }

    /// Move every in-memory chunk to the chunk store. Chunks written before a
    /// failure are dropped from memory so nothing ends up stored twice; the rest
    /// stay in memory and the storage error is returned.
    pub async fn flush_to_local_storage(&mut self) -> Result<usize, RecorderError> {
        if self.chunks.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut result = Ok(());
        for chunk in self.chunks.iter() {
            if let Err(e) = self.store.put(&self.recording_id, chunk).await {
                result = Err(e);
                break;
            }
            written += 1;
        }

        let spilled: Vec<Chunk> = self.chunks.drain(..written).collect();
        self.spilled_chunks += spilled.len();
        self.spilled_size += spilled.iter().map(|c| c.size as u64).sum::<u64>();

        match result {
            Ok(_) => {
                debug!("Flushed {} chunks of {}", written, self.recording_id);
                Ok(written)
            }
            Err(e) => {
                warn!(
                    "Flush of {} stopped after {} chunks: {}",
                    self.recording_id, written, e
                );
                Err(e)
            }
        }
    }

    /// Spilled and in-memory chunks merged in timestamp order. If the chunk
    /// store cannot be read only the in-memory chunks are returned.
    pub async fn all_chunks(&self) -> Vec<Chunk> {
        let mut chunks = match self.store.list(&self.recording_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(
                    "Reading spilled chunks of {} failed, using memory only: {}",
                    self.recording_id, e
                );
                Vec::new()
            }
        };

        chunks.extend(self.chunks.iter().cloned());
        chunks.sort_by_key(|c| c.timestamp);
        chunks.dedup_by_key(|c| c.timestamp);
        chunks
    }

    /// Concatenate the in-memory chunks only.
    pub fn create_final_blob(&self, mime_type: &str) -> MediaBlob {
        MediaBlob::concat(self.chunks.iter(), mime_type)
    }

    /// Concatenate the whole recording, spilled chunks included.
    pub async fn create_complete_final_blob(&self, mime_type: &str) -> MediaBlob {
        let chunks = self.all_chunks().await;
        let blob = MediaBlob::concat(chunks.iter(), mime_type);
        info!(
            "Final blob for {}: {} chunks, {} bytes",
            self.recording_id,
            chunks.len(),
            blob.size()
        );
        blob
    }

    /// Drop in-memory chunks and delete spilled ones. Deletion failures are
    /// logged, never returned.
    pub async fn clear(&mut self) {
        self.chunks.clear();
        self.spilled_chunks = 0;
        self.spilled_size = 0;

        match self.store.delete_recording(&self.recording_id).await {
            Ok(removed) => debug!(
                "Cleared recording {}, {} spilled chunks removed",
                self.recording_id, removed
            ),
            Err(e) => warn!(
                "Failed to delete spilled chunks of {}: {}",
                self.recording_id, e
            ),
        }
    }

    /// Delete chunks of any recording older than `max_age`, e.g. left behind
    /// by sessions that never finished.
    pub async fn cleanup_old_chunks(
        store: &(dyn ChunkStore + Send + Sync),
        max_age: Duration,
    ) -> Result<usize, RecorderError> {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let removed = store.delete_older_than(cutoff).await?;
        info!("Cleanup removed {} chunks older than {:?}", removed, max_age);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileChunkStore, MemoryChunkStore};
    use std::collections::HashSet;

    fn settings(max_size: u64, max_duration: Duration, auto_flush: bool) -> BufferSettings {
        BufferSettings {
            max_size,
            max_duration,
            auto_flush,
        }
    }

    fn payload(size: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; size])
    }

    #[test]
    fn near_limit_boundary() {
        let s = settings(100, Duration::from_secs(3600), true);
        assert!(!near_limit(79, Duration::ZERO, &s));
        assert!(near_limit(80, Duration::ZERO, &s));
        assert!(near_limit(81, Duration::ZERO, &s));
    }

    #[test]
    fn near_limit_by_duration() {
        let s = settings(u64::MAX, Duration::from_secs(10), true);
        assert!(!near_limit(0, Duration::from_millis(7_999), &s));
        assert!(near_limit(0, Duration::from_secs(8), &s));
    }

    #[tokio::test]
    async fn stats_track_memory_chunks() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new("rec", settings(100, Duration::from_secs(3600), false), store);

        buffer.add_chunk(payload(79, 1)).await.unwrap();
        let stats = buffer.stats();
        assert_eq!(stats.total_size, 79);
        assert_eq!(stats.chunk_count, 1);
        assert!(!stats.is_near_limit);

        buffer.add_chunk(payload(1, 1)).await.unwrap();
        assert!(buffer.is_near_limit());
        assert!(buffer.stats().is_near_limit);

        buffer.add_chunk(payload(1, 1)).await.unwrap();
        assert_eq!(buffer.stats().total_size, 81);
        assert!(buffer.is_near_limit());
    }

    #[tokio::test]
    async fn auto_flush_spills_when_near_limit() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(100, Duration::from_secs(3600), true),
            store.clone(),
        );

        buffer.add_chunk(payload(50, 1)).await.unwrap();
        assert_eq!(store.len(), 0);
        buffer.add_chunk(payload(30, 2)).await.unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.spilled_chunks, 2);
        assert_eq!(stats.spilled_size, 80);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn auto_flush_disabled_keeps_everything_in_memory() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(10, Duration::from_secs(3600), false),
            store.clone(),
        );

        for _ in 0..5 {
            buffer.add_chunk(payload(10, 1)).await.unwrap();
        }
        assert_eq!(buffer.stats().chunk_count, 5);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_limit_triggers_flush() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(u64::MAX, Duration::from_secs(10), true),
            store.clone(),
        );

        buffer.add_chunk(payload(1, 1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(7_000)).await;
        buffer.add_chunk(payload(1, 1)).await.unwrap();
        assert!(store.is_empty());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        buffer.add_chunk(payload(1, 1)).await.unwrap();
        assert_eq!(store.len(), 3);
        assert!(buffer.stats().duration >= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn all_chunks_merges_store_and_memory_without_duplicates() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(100, Duration::from_secs(3600), true),
            store,
        );

        let appends = 23;
        for i in 0..appends {
            buffer.add_chunk(payload(15, i as u8)).await.unwrap();
        }

        let chunks = buffer.all_chunks().await;
        assert_eq!(chunks.len(), appends);
        assert!(chunks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let unique: HashSet<i64> = chunks.iter().map(|c| c.timestamp).collect();
        assert_eq!(unique.len(), appends);
        let fills: Vec<u8> = chunks.iter().map(|c| c.payload[0]).collect();
        assert_eq!(fills, (0..appends as u8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn complete_blob_concatenates_in_order() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(1_000, Duration::from_secs(3600), false),
            store,
        );

        buffer.add_chunk(payload(100, 1)).await.unwrap();
        buffer.flush_to_local_storage().await.unwrap();
        buffer.add_chunk(payload(200, 2)).await.unwrap();

        let blob = buffer.create_complete_final_blob("video/webm").await;
        assert_eq!(blob.size(), 300);
        assert_eq!(blob.data[0], 1);
        assert_eq!(blob.data[299], 2);
        assert_eq!(blob.mime_type, "video/webm");

        let memory_only = buffer.create_final_blob("video/webm");
        assert_eq!(memory_only.size(), 200);
    }

    #[tokio::test]
    async fn flush_failure_is_loud_and_keeps_chunks() {
        let store = Arc::new(MemoryChunkStore::with_quota(Some(150)));
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(10_000, Duration::from_secs(3600), false),
            store.clone(),
        );

        buffer.add_chunk(payload(100, 1)).await.unwrap();
        buffer.add_chunk(payload(100, 2)).await.unwrap();

        let res = buffer.flush_to_local_storage().await;
        assert!(matches!(res, Err(RecorderError::QuotaExceeded(_))));
        // the stored chunk left memory, the rejected one stayed
        assert_eq!(store.len(), 1);
        assert_eq!(buffer.stats().chunk_count, 1);
        assert_eq!(buffer.all_chunks().await.len(), 2);
    }

    #[tokio::test]
    async fn auto_flush_failure_propagates_from_add_chunk() {
        let store = Arc::new(MemoryChunkStore::new());
        store.set_available(false);
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(10, Duration::from_secs(3600), true),
            store,
        );

        let res = buffer.add_chunk(payload(10, 1)).await;
        assert!(matches!(res, Err(RecorderError::StorageError(_))));
        assert_eq!(buffer.stats().chunk_count, 1);
    }

    #[tokio::test]
    async fn unreadable_store_falls_back_to_memory() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(1_000, Duration::from_secs(3600), false),
            store.clone(),
        );

        buffer.add_chunk(payload(10, 1)).await.unwrap();
        buffer.flush_to_local_storage().await.unwrap();
        buffer.add_chunk(payload(20, 2)).await.unwrap();

        store.set_available(false);
        let chunks = buffer.all_chunks().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 20);
    }

    #[tokio::test]
    async fn clear_purges_memory_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileChunkStore::new(dir.path().to_string_lossy().to_string()));
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(100, Duration::from_secs(3600), true),
            store.clone(),
        );

        for _ in 0..6 {
            buffer.add_chunk(payload(30, 1)).await.unwrap();
        }
        assert!(!store.list("rec").await.unwrap().is_empty());

        buffer.clear().await;
        assert_eq!(buffer.stats().chunk_count, 0);
        assert!(store.list("rec").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_tolerates_store_failure() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(1_000, Duration::from_secs(3600), false),
            store.clone(),
        );
        buffer.add_chunk(payload(10, 1)).await.unwrap();

        store.set_available(false);
        buffer.clear().await;
        assert_eq!(buffer.stats().chunk_count, 0);
    }

    #[tokio::test]
    async fn cleanup_sweeps_only_old_chunks() {
        let store = MemoryChunkStore::new();
        let now = chrono::Utc::now().timestamp_millis();
        let hour = 3_600_000;
        for (id, ts) in [("a", now - 3 * hour), ("b", now - 2 * hour), ("b", now)] {
            store
                .put(id, &Chunk::new(payload(1, 0), ts, Duration::ZERO))
                .await
                .unwrap();
        }

        let removed = ChunkBuffer::cleanup_old_chunks(&store, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.list("a").await.unwrap().is_empty());
        assert_eq!(store.list("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn initialize_keeps_timestamps_increasing() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut buffer = ChunkBuffer::new(
            "rec",
            settings(1_000, Duration::from_secs(3600), false),
            store,
        );
        buffer.add_chunk(payload(1, 1)).await.unwrap();
        buffer.flush_to_local_storage().await.unwrap();
        buffer.initialize();
        buffer.add_chunk(payload(1, 2)).await.unwrap();

        let chunks = buffer.all_chunks().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].timestamp < chunks[1].timestamp);
    }
}
