pub mod config;
pub mod error;
pub mod filename;
pub mod http;
pub mod orchestrator;
pub mod progress;
pub mod remote;
pub mod strategy;

pub use config::{RemoteSettings, UploadSettings};
pub use error::UploadError;
pub use http::HttpRemote;
pub use orchestrator::{into_result, UploadHints, UploadOrchestrator};
pub use progress::{UploadProgress, UploadStatus, UploadTask};
pub use remote::{ObjectStore, Session, VideoTable};
pub use strategy::UploadStrategy;
