pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod storage;

pub use buffer::{BufferStats, ChunkBuffer};
pub use chunk::{Chunk, ChunkRecord, MediaBlob};
pub use config::{BufferSettings, ChunkStoreSettings};
pub use error::RecorderError;
pub use storage::{create_store, ChunkStore, FileChunkStore, MemoryChunkStore};
