use crate::errors::ServerError;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Object storage rooted at a local directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: Arc<PathBuf>,
}

impl FileStorage {
    pub fn new(path: &str) -> Self {
        Self {
            base_path: Arc::new(PathBuf::from(path)),
        }
    }

    pub fn base_path(&self) -> &Path {
        self.base_path.as_path()
    }

    /// Absolute location of an object, for tools that read files directly
    pub fn full_path(&self, relative_path: &str) -> Result<PathBuf, ServerError> {
        validate_path(relative_path)?;
        Ok(self.base_path.join(relative_path))
    }

    pub async fn write_file(&self, relative_path: &str, content: Bytes) -> Result<(), ServerError> {
        let full_path = self.full_path(relative_path)?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create directory {}: {}", parent.display(), e);
                ServerError::StorageError(format!("Failed to create directory: {}", e))
            })?;
        }

        tokio::fs::write(&full_path, &content).await.map_err(|e| {
            error!("Failed to write file {}: {}", full_path.display(), e);
            ServerError::StorageError(format!("Failed to write file: {}", e))
        })?;

        debug!("Wrote {} bytes to {}", content.len(), full_path.display());
        Ok(())
    }

    /// `None` when the object does not exist
    pub async fn read_file(&self, relative_path: &str) -> Result<Option<Bytes>, ServerError> {
        let full_path = self.full_path(relative_path)?;
        match tokio::fs::read(&full_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::StorageError(format!(
                "Failed to read file {}: {}",
                full_path.display(),
                e
            ))),
        }
    }

    /// Returns whether the object existed
    pub async fn delete_file(&self, relative_path: &str) -> Result<bool, ServerError> {
        let full_path = self.full_path(relative_path)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!("Deleted {}", full_path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServerError::StorageError(format!(
                "Failed to delete file {}: {}",
                full_path.display(),
                e
            ))),
        }
    }
}

/// Object paths are relative, `/`-separated and never leave the root.
pub fn validate_path(path: &str) -> Result<(), ServerError> {
    if path.is_empty() || path.ends_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(ServerError::RequestError(format!(
            "Invalid object path: {:?}",
            path
        )));
    }

    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ServerError::RequestError(format!(
            "Invalid object path: {:?}",
            path
        )));
    }

    Ok(())
}

/// Content type served for an object, from its extension
pub fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("webm") => "video/webm",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("ogv") | Some("ogg") => "video/ogg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_path("videos/u/a.webm").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("videos/../secret").is_err());
        assert!(validate_path("videos/./a.webm").is_err());
        assert!(validate_path("videos/u/").is_err());
        assert!(validate_path("videos\\u\\a.webm").is_err());
        assert!(validate_path("videos//a.webm").is_err());
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type("videos/u/a.webm"), "video/webm");
        assert_eq!(content_type("videos/u/a.MP4"), "video/mp4");
        assert_eq!(content_type("thumbnails/u/x.jpg"), "image/jpeg");
        assert_eq!(content_type("videos/u/noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_str().unwrap());

        storage
            .write_file("videos/u/a.webm", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let data = storage.read_file("videos/u/a.webm").await.unwrap();
        assert_eq!(data, Some(Bytes::from_static(b"abc")));

        assert!(storage.delete_file("videos/u/a.webm").await.unwrap());
        assert!(!storage.delete_file("videos/u/a.webm").await.unwrap());
        assert_eq!(storage.read_file("videos/u/a.webm").await.unwrap(), None);
    }

    #[tokio::test]
    async fn refuses_invalid_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_str().unwrap());
        let res = storage
            .write_file("../outside.webm", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(res, Err(ServerError::RequestError(_))));
    }
}
