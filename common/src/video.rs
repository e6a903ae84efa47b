use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a stored video row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Uploaded,
    Processing,
    Processed,
    Error,
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoStatus::Uploaded => write!(f, "uploaded"),
            VideoStatus::Processing => write!(f, "processing"),
            VideoStatus::Processed => write!(f, "processed"),
            VideoStatus::Error => write!(f, "error"),
        }
    }
}

/// Quality tier requested by the capturing client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Low => write!(f, "low"),
            Quality::Medium => write!(f, "medium"),
            Quality::High => write!(f, "high"),
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            _ => Err(format!("unknown quality tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Row payload sent when a finished upload is registered.
/// The owner is never taken from the payload, the server assigns it.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVideo {
    pub upload_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
    pub duration: Option<f64>, // seconds
    pub format: String,
    #[serde(default)]
    pub quality: Quality,
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A row of the `videos` table
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub upload_id: String,
    pub user_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
    pub duration: Option<f64>,
    pub format: String,
    pub quality: Quality,
    pub resolution: Option<Resolution>,
    pub thumbnail_path: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: VideoStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    pub fn from_new(video: NewVideo, user_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            upload_id: video.upload_id,
            user_id: user_id.to_string(),
            filename: video.filename,
            file_path: video.file_path,
            file_size: video.file_size,
            duration: video.duration,
            format: video.format,
            quality: video.quality,
            resolution: video.resolution,
            thumbnail_path: None,
            metadata: video.metadata,
            status: VideoStatus::Uploaded,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// What the caller of an upload knows about the media it hands over
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub upload_id: String,
    pub filename: String,
    pub size: u64,
    pub duration: Option<f64>,
    pub format: String,
    #[serde(default)]
    pub quality: Quality,
    pub resolution: Option<Resolution>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Outcome of an upload. Failures are reported here rather than raised.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub upload_id: String,
    pub file_path: Option<String>,
    pub public_url: Option<String>,
    pub video_id: Option<Uuid>,
    pub error: Option<String>,
}

impl UploadResponse {
    pub fn failed(upload_id: &str, error: String) -> Self {
        Self {
            success: false,
            upload_id: upload_id.to_string(),
            file_path: None,
            public_url: None,
            video_id: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOperation {
    Thumbnail,
    Metadata,
    Compress,
    FormatConvert,
}

impl fmt::Display for ProcessingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOperation::Thumbnail => write!(f, "thumbnail"),
            ProcessingOperation::Metadata => write!(f, "metadata"),
            ProcessingOperation::Compress => write!(f, "compress"),
            ProcessingOperation::FormatConvert => write!(f, "format_convert"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub video_id: Uuid,
    pub operations: Vec<ProcessingOperation>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: ProcessingOperation,
    pub success: bool,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResponse {
    pub video_id: Uuid,
    pub success: bool,
    pub results: Vec<OperationResult>,
}

/// Identity of the authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
}
