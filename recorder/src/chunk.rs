use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A timestamped slice of captured media. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub payload: Bytes,
    pub timestamp: i64,     // ms since the Unix epoch
    pub size: usize,        // payload size in bytes
    pub duration: Duration, // elapsed since recording start
}

impl Chunk {
    pub fn new(payload: Bytes, timestamp: i64, duration: Duration) -> Self {
        Self {
            size: payload.len(),
            payload,
            timestamp,
            duration,
        }
    }
}

/// Persisted description of a spilled chunk, stored next to its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub recording_id: String,
    pub timestamp: i64,
    pub size: usize,
    pub duration_ms: u64,
}

impl ChunkRecord {
    pub fn new(recording_id: &str, chunk: &Chunk) -> Self {
        Self {
            id: record_id(recording_id, chunk.timestamp),
            recording_id: recording_id.to_string(),
            timestamp: chunk.timestamp,
            size: chunk.size,
            duration_ms: chunk.duration.as_millis() as u64,
        }
    }

    pub fn into_chunk(self, payload: Bytes) -> Chunk {
        Chunk {
            size: payload.len(),
            payload,
            timestamp: self.timestamp,
            duration: Duration::from_millis(self.duration_ms),
        }
    }
}

/// Key of a chunk in the local store
pub fn record_id(recording_id: &str, timestamp: i64) -> String {
    format!("{}_{}", recording_id, timestamp)
}

/// Finalized recording, tagged with its media type
#[derive(Debug, Clone, PartialEq)]
pub struct MediaBlob {
    pub data: Bytes,
    pub mime_type: String,
}

impl MediaBlob {
    pub fn new(data: Bytes, mime_type: &str) -> Self {
        Self {
            data,
            mime_type: mime_type.to_string(),
        }
    }

    /// Concatenate chunk payloads in the given order, no re-encoding.
    pub fn concat<'a, I>(chunks: I, mime_type: &str) -> Self
    where
        I: IntoIterator<Item = &'a Chunk>,
    {
        let chunks: Vec<&Chunk> = chunks.into_iter().collect();
        let total = chunks.iter().map(|c| c.size).sum();
        let mut buffer = BytesMut::with_capacity(total);
        for chunk in chunks {
            buffer.put(chunk.payload.clone());
        }

        Self::new(buffer.freeze(), mime_type)
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Container format derived from the media type, e.g. `webm` for `video/webm;codecs=vp9`
    pub fn format(&self) -> String {
        self.mime_type
            .split(';')
            .next()
            .and_then(|t| t.split('/').nth(1))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "bin".to_string())
    }
}
