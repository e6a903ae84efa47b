use std::{error::Error, fmt};

#[derive(Debug, Clone, PartialEq)]
pub enum UploadError {
    ConfigError(String),
    AuthError(String),
    NetworkError(String),
    StorageError(String),
    RequestError(String),
    /// An upload that ran to a terminal failure, as reported in its response
    UploadFailed(String),
    Cancelled,
}

impl UploadError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::NetworkError(_))
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            UploadError::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            UploadError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            UploadError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            UploadError::RequestError(msg) => write!(f, "Request error: {}", msg),
            UploadError::UploadFailed(msg) => write!(f, "Upload failed: {}", msg),
            UploadError::Cancelled => write!(f, "Upload cancelled"),
        }
    }
}

impl Error for UploadError {}
