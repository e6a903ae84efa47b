use std::{error::Error, fmt};

#[derive(Debug)]
pub enum RecorderError {
    ConfigError(String),
    StorageError(String),
    QuotaExceeded(String),
    InvalidRecordingId(String),
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            RecorderError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            RecorderError::QuotaExceeded(msg) => write!(f, "Storage quota exceeded: {}", msg),
            RecorderError::InvalidRecordingId(id) => write!(f, "Invalid recording id: {:?}", id),
        }
    }
}

impl Error for RecorderError {}
