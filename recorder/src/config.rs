use serde::Deserialize;
use std::time::Duration;

/// Limits and spill policy of a recording buffer
#[derive(Debug, Clone, Deserialize)]
pub struct BufferSettings {
    /// Maximum in-memory size in bytes
    #[serde(default = "BufferSettings::default_max_size")]
    pub max_size: u64,
    /// Maximum recording duration
    #[serde(
        default = "BufferSettings::default_max_duration",
        with = "humantime_serde"
    )]
    pub max_duration: Duration,
    /// Spill to the chunk store as soon as the buffer is near its limits
    #[serde(default = "BufferSettings::default_auto_flush")]
    pub auto_flush: bool,
}

impl BufferSettings {
    fn default_max_size() -> u64 {
        100 * 1024 * 1024
    }

    fn default_max_duration() -> Duration {
        Duration::from_secs(10 * 60)
    }

    fn default_auto_flush() -> bool {
        true
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_size: Self::default_max_size(),
            max_duration: Self::default_max_duration(),
            auto_flush: Self::default_auto_flush(),
        }
    }
}

/// Where spilled chunks are kept
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkStoreSettings {
    Fs {
        #[serde(default = "default_fs_path")]
        path: String,
    },
    Memory {
        #[serde(default)]
        quota: Option<u64>,
    },
}

fn default_fs_path() -> String {
    "./chunks".to_string()
}

impl Default for ChunkStoreSettings {
    fn default() -> Self {
        Self::Fs {
            path: default_fs_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        #[serde(default)]
        buffer: BufferSettings,
        #[serde(default)]
        store: ChunkStoreSettings,
    }

    #[test]
    fn defaults_when_sections_are_missing() {
        let w: Wrapper = toml::from_str("").unwrap();
        assert_eq!(w.buffer.max_size, 100 * 1024 * 1024);
        assert_eq!(w.buffer.max_duration, Duration::from_secs(600));
        assert!(w.buffer.auto_flush);
        match w.store {
            ChunkStoreSettings::Fs { path } => assert_eq!(path, "./chunks"),
            _ => panic!("default store should be fs"),
        }
    }

    #[test]
    fn parses_humantime_durations() {
        let toml_str = r#"
[buffer]
max_size = 1048576
max_duration = "2m 30s"
auto_flush = false

[store]
type = "memory"
quota = 4096
"#;
        let w: Wrapper = toml::from_str(toml_str).unwrap();
        assert_eq!(w.buffer.max_size, 1_048_576);
        assert_eq!(w.buffer.max_duration, Duration::from_secs(150));
        assert!(!w.buffer.auto_flush);
        match w.store {
            ChunkStoreSettings::Memory { quota } => assert_eq!(quota, Some(4096)),
            _ => panic!("expected memory store"),
        }
    }
}
