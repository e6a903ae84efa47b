use serde::Serialize;
use serde_with::skip_serializing_none;
use std::fmt;
use std::time::Duration;

/// State of one tracked upload.
/// `Pending -> Uploading -> Processing -> Completed`, with `Error` and
/// `Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Error | UploadStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Error) | (_, Cancelled) => true,
            (Pending, Uploading) => true,
            // repeated while progress advances
            (Uploading, Uploading) => true,
            (Uploading, Processing) => true,
            (Processing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of a tracked upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub id: String,
    pub total: u64,
    pub loaded: u64,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl UploadTask {
    pub fn new(id: &str, total: u64) -> Self {
        Self {
            id: id.to_string(),
            total,
            loaded: 0,
            status: UploadStatus::Pending,
            error: None,
        }
    }

    /// Apply a transition; refused transitions leave the task untouched.
    pub fn transition(&mut self, next: UploadStatus, loaded: u64, error: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        self.status = next;
        self.loaded = loaded.min(self.total).max(self.loaded);
        if error.is_some() {
            self.error = error;
        }
        true
    }
}

/// Progress event delivered to the caller of an upload
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub upload_id: String,
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
    /// bytes per second
    pub speed: f64,
    /// seconds left at the current speed
    pub remaining: Option<f64>,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl UploadProgress {
    pub fn from_task(task: &UploadTask, elapsed: Duration) -> Self {
        let percentage = if task.status == UploadStatus::Completed {
            100.0
        } else if task.total == 0 {
            0.0
        } else {
            task.loaded as f64 * 100.0 / task.total as f64
        };

        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            task.loaded as f64 / secs
        } else {
            0.0
        };
        let remaining = if task.status.is_terminal() {
            Some(0.0)
        } else if speed > 0.0 {
            Some((task.total - task.loaded) as f64 / speed)
        } else {
            None
        };

        Self {
            upload_id: task.id.clone(),
            loaded: task.loaded,
            total: task.total,
            percentage,
            speed,
            remaining,
            status: task.status,
            error: task.error.clone(),
        }
    }
}
