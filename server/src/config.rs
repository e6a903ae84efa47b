use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub processing: Processing,
}

#[derive(Debug, Default, Deserialize)]
pub struct Runtime {
    pub threads: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    #[serde(default = "Http::default_addr")]
    pub addr: String,
    pub max_buffer_size: Option<usize>,
    /// How long open connections may take to finish on shutdown
    #[serde(default = "Http::default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Http {
    fn default_addr() -> String {
        "0.0.0.0:9090".to_string()
    }

    fn default_shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for Http {
    fn default() -> Self {
        Self {
            addr: Self::default_addr(),
            max_buffer_size: None,
            shutdown_timeout: Self::default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Storage {
    /// Root of stored objects; the video table lives here as `videos.json`
    #[serde(default = "Storage::default_path")]
    pub path: String,
}

impl Storage {
    fn default_path() -> String {
        "./storage".to_string()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
}

impl Auth {
    pub fn token_map(&self) -> HashMap<String, String> {
        self.tokens
            .iter()
            .map(|t| (t.token.clone(), t.user_id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Processing {
    #[serde(default = "Processing::default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "Processing::default_ffprobe")]
    pub ffprobe: String,
    /// Position of the thumbnail frame in seconds
    #[serde(default = "Processing::default_thumbnail_at")]
    pub thumbnail_at: f64,
    #[serde(default = "Processing::default_thumbnail_width")]
    pub thumbnail_width: u32,
}

impl Processing {
    fn default_ffmpeg() -> String {
        "ffmpeg".to_string()
    }

    fn default_ffprobe() -> String {
        "ffprobe".to_string()
    }

    fn default_thumbnail_at() -> f64 {
        1.0
    }

    fn default_thumbnail_width() -> u32 {
        320
    }
}

impl Default for Processing {
    fn default() -> Self {
        Self {
            ffmpeg: Self::default_ffmpeg(),
            ffprobe: Self::default_ffprobe(),
            thumbnail_at: Self::default_thumbnail_at(),
            thumbnail_width: Self::default_thumbnail_width(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let setting: Setting = toml::from_str("").unwrap();
        assert_eq!(setting.http.addr, "0.0.0.0:9090");
        assert_eq!(setting.http.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(setting.storage.path, "./storage");
        assert!(setting.auth.tokens.is_empty());
        assert_eq!(setting.processing.ffmpeg, "ffmpeg");
    }

    #[test]
    fn reads_tokens() {
        let setting: Setting = toml::from_str(
            r#"
[http]
addr = ":8080"
shutdown_timeout = "5s"

[[auth.tokens]]
token = "alpha"
user_id = "user-a"

[[auth.tokens]]
token = "beta"
user_id = "user-b"
"#,
        )
        .unwrap();

        let tokens = setting.auth.token_map();
        assert_eq!(setting.http.addr, ":8080");
        assert_eq!(setting.http.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(tokens.get("alpha").map(String::as_str), Some("user-a"));
        assert_eq!(tokens.get("beta").map(String::as_str), Some("user-b"));
    }
}
