use crate::errors::ServerError;
use common::video::{NewVideo, VideoRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// The `videos` table. Every row belongs to one user and is only visible to
/// that user. The table is kept in memory and written out as a JSON array
/// after each mutation.
#[derive(Debug)]
pub struct VideoTable {
    rows: RwLock<HashMap<Uuid, VideoRecord>>,
    file: PathBuf,
    persist: Mutex<()>,
}

impl VideoTable {
    /// Load the table from `file`, starting empty when it does not exist yet.
    pub async fn open(file: PathBuf) -> Result<Self, ServerError> {
        let rows = match tokio::fs::read(&file).await {
            Ok(data) => serde_json::from_slice::<Vec<VideoRecord>>(&data).map_err(|e| {
                ServerError::StorageError(format!("Invalid table {}: {}", file.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ServerError::StorageError(format!(
                    "Failed to read table {}: {}",
                    file.display(),
                    e
                )))
            }
        };

        info!("Loaded {} videos from {}", rows.len(), file.display());
        Ok(Self {
            rows: RwLock::new(rows.into_iter().map(|r| (r.id, r)).collect()),
            file,
            persist: Mutex::new(()),
        })
    }

    pub async fn insert(&self, user_id: &str, video: NewVideo) -> Result<VideoRecord, ServerError> {
        let record = VideoRecord::from_new(video, user_id);
        self.rows.write().insert(record.id, record.clone());
        debug!("Inserted video {} for {}", record.id, user_id);
        self.save().await?;
        Ok(record)
    }

    /// Rows of `user_id`, newest first
    pub fn list(&self, user_id: &str) -> Vec<VideoRecord> {
        let mut rows: Vec<VideoRecord> = self
            .rows
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn get(&self, user_id: &str, id: Uuid) -> Option<VideoRecord> {
        self.rows
            .read()
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .cloned()
    }

    /// Apply `f` to an own row and return the updated copy.
    pub async fn update<F>(
        &self,
        user_id: &str,
        id: Uuid,
        f: F,
    ) -> Result<Option<VideoRecord>, ServerError>
    where
        F: FnOnce(&mut VideoRecord),
    {
        let updated = {
            let mut rows = self.rows.write();
            match rows.get_mut(&id).filter(|r| r.user_id == user_id) {
                Some(row) => {
                    f(row);
                    Some(row.clone())
                }
                None => None,
            }
        };

        if updated.is_some() {
            self.save().await?;
        }
        Ok(updated)
    }

    /// Remove an own row and return it.
    pub async fn delete(&self, user_id: &str, id: Uuid) -> Result<Option<VideoRecord>, ServerError> {
        let removed = {
            let mut rows = self.rows.write();
            let owned = rows.get(&id).is_some_and(|r| r.user_id == user_id);
            if owned {
                rows.remove(&id)
            } else {
                None
            }
        };

        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn save(&self) -> Result<(), ServerError> {
        let _guard = self.persist.lock().await;

        let data = {
            let rows = self.rows.read();
            let mut snapshot: Vec<&VideoRecord> = rows.values().collect();
            snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            serde_json::to_vec_pretty(&snapshot)
                .map_err(|e| ServerError::StorageError(format!("Failed to encode table: {}", e)))?
        };

        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ServerError::StorageError(format!("Failed to create directory: {}", e))
            })?;
        }

        let tmp = self.file.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| ServerError::StorageError(format!("Failed to write table: {}", e)))?;
        tokio::fs::rename(&tmp, &self.file)
            .await
            .map_err(|e| ServerError::StorageError(format!("Failed to replace table: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::video::{Quality, VideoStatus};

    fn new_video(name: &str) -> NewVideo {
        NewVideo {
            upload_id: format!("upload_{}", name),
            filename: name.to_string(),
            file_path: format!("videos/u/{}", name),
            file_size: 10,
            duration: Some(1.5),
            format: "webm".to_string(),
            quality: Quality::High,
            resolution: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn rows_are_scoped_to_their_owner() {
        let dir = tempfile::tempdir().unwrap();
        let table = VideoTable::open(dir.path().join("videos.json")).await.unwrap();

        let a = table.insert("alice", new_video("a.webm")).await.unwrap();
        let b = table.insert("bob", new_video("b.webm")).await.unwrap();

        assert_eq!(a.status, VideoStatus::Uploaded);
        assert_eq!(a.user_id, "alice");
        assert_eq!(table.list("alice").len(), 1);
        assert!(table.get("alice", b.id).is_none());
        assert!(table.get("bob", b.id).is_some());

        assert!(table.delete("alice", b.id).await.unwrap().is_none());
        assert!(table
            .update("alice", b.id, |r| r.status = VideoStatus::Error)
            .await
            .unwrap()
            .is_none());
        assert_eq!(table.list("bob").len(), 1);
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let table = VideoTable::open(dir.path().join("videos.json")).await.unwrap();

        let first = table.insert("u", new_video("1.webm")).await.unwrap();
        let second = table.insert("u", new_video("2.webm")).await.unwrap();
        table
            .update("u", first.id, |r| {
                r.created_at = second.created_at - chrono::Duration::seconds(5)
            })
            .await
            .unwrap();

        let ids: Vec<Uuid> = table.list("u").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("videos.json");

        let kept = {
            let table = VideoTable::open(file.clone()).await.unwrap();
            let kept = table.insert("u", new_video("keep.webm")).await.unwrap();
            let gone = table.insert("u", new_video("gone.webm")).await.unwrap();
            table
                .update("u", kept.id, |r| r.status = VideoStatus::Processed)
                .await
                .unwrap();
            table.delete("u", gone.id).await.unwrap();
            kept
        };

        let table = VideoTable::open(file).await.unwrap();
        assert_eq!(table.list("u").len(), 1);
        let row = table.get("u", kept.id).unwrap();
        assert_eq!(row.status, VideoStatus::Processed);
        assert_eq!(row.quality, Quality::High);
        assert_eq!(row.duration, Some(1.5));
    }

    #[tokio::test]
    async fn rejects_corrupt_table() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("videos.json");
        tokio::fs::write(&file, b"not json").await.unwrap();
        assert!(matches!(
            VideoTable::open(file).await,
            Err(ServerError::StorageError(_))
        ));
    }
}
