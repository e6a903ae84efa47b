use crate::error::UploadError;
use async_trait::async_trait;
use bytes::Bytes;
use common::video::{NewVideo, Principal, VideoRecord};
use uuid::Uuid;

/// Resolves who is uploading
#[async_trait]
pub trait Session {
    /// `None` when nobody is signed in
    async fn current_user(&self) -> Result<Option<Principal>, UploadError>;
}

/// Remote object storage
#[async_trait]
pub trait ObjectStore {
    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), UploadError>;

    fn public_url(&self, path: &str) -> String;

    async fn delete(&self, path: &str) -> Result<(), UploadError>;
}

/// The remote `videos` table, scoped to the signed-in user
#[async_trait]
pub trait VideoTable {
    async fn insert(&self, video: &NewVideo) -> Result<VideoRecord, UploadError>;

    async fn list(&self) -> Result<Vec<VideoRecord>, UploadError>;

    async fn delete(&self, id: Uuid) -> Result<(), UploadError>;
}
