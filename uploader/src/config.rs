use recorder::{BufferSettings, ChunkStoreSettings};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for the uploader CLI
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub remote: RemoteSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub store: ChunkStoreSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub runtime: Runtime,
}

#[derive(Debug, Default, Deserialize)]
pub struct Runtime {
    pub threads: Option<usize>,
}

/// Remote storage server
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the server, e.g. `http://127.0.0.1:9090`
    pub url: String,
    /// Bearer token identifying the user
    pub token: String,
    /// Base for public object URLs when it differs from `url`
    #[serde(default)]
    pub public_url: Option<String>,
}

/// Transmission tuning
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSettings {
    /// Blobs above twice this size use the chunked strategy
    #[serde(default = "UploadSettings::default_chunk_size")]
    pub chunk_size: u64,
    /// Delay between progress steps of the chunked strategy
    #[serde(
        default = "UploadSettings::default_step_delay",
        with = "humantime_serde"
    )]
    pub step_delay: Duration,
    #[serde(default = "UploadSettings::default_max_retries")]
    pub max_retries: u32,
    /// First retry delay, doubled for every further attempt
    #[serde(
        default = "UploadSettings::default_retry_backoff",
        with = "humantime_serde"
    )]
    pub retry_backoff: Duration,
}

impl UploadSettings {
    fn default_chunk_size() -> u64 {
        5 * 1024 * 1024
    }

    fn default_step_delay() -> Duration {
        Duration::from_millis(100)
    }

    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_backoff() -> Duration {
        Duration::from_millis(500)
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: Self::default_chunk_size(),
            step_delay: Self::default_step_delay(),
            max_retries: Self::default_max_retries(),
            retry_backoff: Self::default_retry_backoff(),
        }
    }
}

/// How the `record` command feeds a file into the buffer
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureSettings {
    /// Bytes per produced chunk
    #[serde(default = "CaptureSettings::default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Pause between two chunks, like a recorder timeslice
    #[serde(
        default = "CaptureSettings::default_timeslice",
        with = "humantime_serde"
    )]
    pub timeslice: Duration,
}

impl CaptureSettings {
    fn default_chunk_bytes() -> usize {
        256 * 1024
    }

    fn default_timeslice() -> Duration {
        Duration::from_millis(100)
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: Self::default_chunk_bytes(),
            timeslice: Self::default_timeslice(),
        }
    }
}
