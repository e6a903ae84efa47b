use crate::config::UploadSettings;
use crate::error::UploadError;
use crate::filename::storage_path;
use crate::progress::{UploadProgress, UploadStatus, UploadTask};
use crate::remote::{ObjectStore, Session, VideoTable};
use crate::strategy::UploadStrategy;
use bytes::Bytes;
use chrono::Utc;
use common::video::{NewVideo, Quality, Resolution, UploadRequest, UploadResponse};
use parking_lot::Mutex;
use recorder::MediaBlob;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the caller already knows about the media
#[derive(Debug, Clone, Default)]
pub struct UploadHints {
    /// seconds
    pub duration: Option<f64>,
    /// Container format; derived from the blob's media type when absent
    pub format: Option<String>,
    pub quality: Quality,
    pub resolution: Option<Resolution>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

struct ActiveUpload {
    token: CancellationToken,
    task: UploadTask,
    start: Instant,
}

/// Untracks an upload when its future completes or is dropped
struct Registration<'a> {
    uploads: &'a Mutex<HashMap<String, ActiveUpload>>,
    upload_id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.uploads.lock().remove(self.upload_id).is_some() {
            debug!("Upload {} untracked", self.upload_id);
        }
    }
}

/// Sends finalized recordings to remote storage and registers them in the
/// `videos` table. Every upload is tracked by id until it reaches a terminal
/// state and can be cancelled meanwhile.
pub struct UploadOrchestrator {
    settings: UploadSettings,
    session: Arc<dyn Session + Send + Sync>,
    store: Arc<dyn ObjectStore + Send + Sync>,
    table: Arc<dyn VideoTable + Send + Sync>,
    uploads: Mutex<HashMap<String, ActiveUpload>>,
}

impl UploadOrchestrator {
    pub fn new(
        settings: UploadSettings,
        session: Arc<dyn Session + Send + Sync>,
        store: Arc<dyn ObjectStore + Send + Sync>,
        table: Arc<dyn VideoTable + Send + Sync>,
    ) -> Self {
        Self {
            settings,
            session,
            store,
            table,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Upload `blob` as `filename`. Never fails: errors and cancellation are
    /// reported through the returned response and a final progress event.
    pub async fn upload_video(
        &self,
        blob: MediaBlob,
        filename: &str,
        hints: UploadHints,
        progress: Option<UnboundedSender<UploadProgress>>,
    ) -> UploadResponse {
        let upload_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.uploads.lock().insert(
            upload_id.clone(),
            ActiveUpload {
                token: token.clone(),
                task: UploadTask::new(&upload_id, blob.size()),
                start: Instant::now(),
            },
        );
        let _registration = Registration {
            uploads: &self.uploads,
            upload_id: &upload_id,
        };
        info!(
            "Upload {} registered: {} ({} bytes, {})",
            upload_id,
            filename,
            blob.size(),
            blob.mime_type
        );

        let reporter = Reporter {
            orchestrator: self,
            upload_id: &upload_id,
            sender: progress,
        };
        if let Some(task) = self.snapshot(&upload_id) {
            reporter.send(&task);
        }

        let request = describe(&upload_id, filename, &blob, hints);
        debug!("Upload {} request: {:?}", upload_id, request);

        let response = match self.run(&token, blob, request, &reporter).await {
            Ok(response) => response,
            Err(e) => {
                let status = if token.is_cancelled() || e == UploadError::Cancelled {
                    info!("Upload {} cancelled", upload_id);
                    UploadStatus::Cancelled
                } else {
                    error!("Upload {} failed: {}", upload_id, e);
                    UploadStatus::Error
                };
                let error = if status == UploadStatus::Cancelled {
                    UploadError::Cancelled.to_string()
                } else {
                    e.to_string()
                };
                reporter.report(status, None, Some(error.clone()));
                UploadResponse::failed(&upload_id, error)
            }
        };

        response
    }

    async fn run(
        &self,
        token: &CancellationToken,
        blob: MediaBlob,
        request: UploadRequest,
        reporter: &Reporter<'_>,
    ) -> Result<UploadResponse, UploadError> {
        let upload_id = request.upload_id.as_str();
        let principal = cancellable(token, self.session.current_user())
            .await?
            .ok_or_else(|| UploadError::AuthError("User not authenticated".to_string()))?;

        let path = storage_path(&principal.id, Utc::now(), &request.filename);
        let total = blob.size();
        let strategy = UploadStrategy::select(total, self.settings.chunk_size);
        info!(
            "Upload {}: {} strategy to {}",
            upload_id,
            strategy.name(),
            path
        );
        reporter.advance(UploadStatus::Uploading, 0);

        if let UploadStrategy::Chunked { chunk_size, chunks } = strategy {
            // the last step is reported once the store acknowledged the blob
            for step in 1..chunks {
                cancellable(token, async {
                    tokio::time::sleep(self.settings.step_delay).await;
                    Ok::<(), UploadError>(())
                })
                .await?;
                reporter.report(UploadStatus::Uploading, Some(step * chunk_size), None);
            }
        }

        self.transmit(upload_id, token, &path, blob.data.clone(), &blob.mime_type)
            .await?;

        reporter.advance(UploadStatus::Processing, total);
        let public_url = self.store.public_url(&path);

        let video = build_video(request.clone(), &path, &blob.mime_type, &principal.id);
        let video_id = match cancellable(token, self.table.insert(&video)).await {
            Ok(row) => {
                debug!("Upload {}: metadata row {}", upload_id, row.id);
                Some(row.id)
            }
            Err(UploadError::Cancelled) => {
                self.discard(upload_id, &path).await;
                return Err(UploadError::Cancelled);
            }
            Err(e) => {
                warn!("Upload {}: failed to save metadata: {}", upload_id, e);
                None
            }
        };

        reporter.report(UploadStatus::Completed, Some(total), None);
        info!("Upload {} completed: {}", upload_id, public_url);

        Ok(UploadResponse {
            success: true,
            upload_id: upload_id.to_string(),
            file_path: Some(path),
            public_url: Some(public_url),
            video_id,
            error: None,
        })
    }

    /// Send the whole blob, retrying network failures with exponential backoff.
    async fn transmit(
        &self,
        upload_id: &str,
        token: &CancellationToken,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), UploadError> {
        let mut attempt = 0;
        let mut backoff = self.settings.retry_backoff;
        loop {
            let res = cancellable(token, self.store.upload(path, data.clone(), content_type)).await;
            match res {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    warn!(
                        "Upload {}: attempt {} failed: {}, retrying in {:?}",
                        upload_id, attempt, e, backoff
                    );
                    cancellable(token, async {
                        tokio::time::sleep(backoff).await;
                        Ok::<(), UploadError>(())
                    })
                    .await?;
                    backoff = next_backoff(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best effort removal of an object whose upload was cancelled after it
    /// reached the store.
    async fn discard(&self, upload_id: &str, path: &str) {
        match self.store.delete(path).await {
            Ok(_) => info!("Upload {}: removed {} from the store", upload_id, path),
            Err(e) => warn!("Upload {}: failed to remove {}: {}", upload_id, path, e),
        }
    }

    /// Signal cancellation of `upload_id`. `false` when it is unknown or finished.
    pub fn cancel_upload(&self, upload_id: &str) -> bool {
        let uploads = self.uploads.lock();
        match uploads.get(upload_id) {
            Some(upload) if !upload.task.status.is_terminal() => {
                info!("Cancelling upload {}", upload_id);
                upload.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all_uploads(&self) -> usize {
        let ids = self.active_uploads();
        ids.iter().filter(|id| self.cancel_upload(id)).count()
    }

    pub fn is_upload_active(&self, upload_id: &str) -> bool {
        self.uploads.lock().contains_key(upload_id)
    }

    pub fn active_uploads(&self) -> Vec<String> {
        self.uploads.lock().keys().cloned().collect()
    }

    /// Current state of a tracked upload
    pub fn task(&self, upload_id: &str) -> Option<UploadTask> {
        self.snapshot(upload_id)
    }

    fn snapshot(&self, upload_id: &str) -> Option<UploadTask> {
        self.uploads.lock().get(upload_id).map(|u| u.task.clone())
    }

    fn transition(
        &self,
        upload_id: &str,
        status: UploadStatus,
        loaded: Option<u64>,
        error: Option<String>,
    ) -> Option<(UploadTask, Instant)> {
        let mut uploads = self.uploads.lock();
        let upload = uploads.get_mut(upload_id)?;
        let loaded = loaded.unwrap_or(upload.task.loaded);
        if !upload.task.transition(status, loaded, error) {
            debug!(
                "Upload {}: ignored transition {} -> {}",
                upload_id, upload.task.status, status
            );
            return None;
        }

        Some((upload.task.clone(), upload.start))
    }
}

/// Applies transitions to one tracked upload and forwards them to its listener
struct Reporter<'a> {
    orchestrator: &'a UploadOrchestrator,
    upload_id: &'a str,
    sender: Option<UnboundedSender<UploadProgress>>,
}

impl Reporter<'_> {
    /// Transition and emit a progress event
    fn report(&self, status: UploadStatus, loaded: Option<u64>, error: Option<String>) {
        if let Some((task, start)) =
            self.orchestrator
                .transition(self.upload_id, status, loaded, error)
        {
            self.emit(&task, start);
        }
    }

    /// Transition without emitting
    fn advance(&self, status: UploadStatus, loaded: u64) {
        self.orchestrator
            .transition(self.upload_id, status, Some(loaded), None);
    }

    fn send(&self, task: &UploadTask) {
        self.emit(task, Instant::now());
    }

    fn emit(&self, task: &UploadTask, start: Instant) {
        let event = UploadProgress::from_task(task, start.elapsed());
        debug!(
            "Upload {}: {} {:.1}%",
            event.upload_id, event.status, event.percentage
        );
        if let Some(sender) = &self.sender {
            // a listener that went away does not stop the upload
            let _ = sender.send(event);
        }
    }
}

async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, UploadError>
where
    F: Future<Output = Result<T, UploadError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(UploadError::Cancelled),
        res = fut => res,
    }
}

fn next_backoff(backoff: Duration) -> Duration {
    backoff.saturating_mul(2)
}

/// Map a finished upload to a `Result` for callers that treat failure as an error
pub fn into_result(response: UploadResponse) -> Result<UploadResponse, UploadError> {
    if response.success {
        return Ok(response);
    }

    let cancelled = UploadError::Cancelled.to_string();
    match response.error {
        Some(e) if e == cancelled => Err(UploadError::Cancelled),
        Some(e) => Err(UploadError::UploadFailed(e)),
        None => Err(UploadError::UploadFailed(format!(
            "upload {} did not complete",
            response.upload_id
        ))),
    }
}

fn describe(
    upload_id: &str,
    filename: &str,
    blob: &MediaBlob,
    hints: UploadHints,
) -> UploadRequest {
    UploadRequest {
        upload_id: upload_id.to_string(),
        filename: filename.to_string(),
        size: blob.size(),
        duration: hints.duration,
        format: hints.format.unwrap_or_else(|| blob.format()),
        quality: hints.quality,
        resolution: hints.resolution,
        metadata: (!hints.metadata.is_empty()).then_some(hints.metadata),
    }
}

fn build_video(request: UploadRequest, path: &str, mime_type: &str, user_id: &str) -> NewVideo {
    let mut metadata = request.metadata.unwrap_or_default();
    metadata.insert(
        "original_filename".to_string(),
        request.filename.as_str().into(),
    );
    metadata.insert("uploaded_at".to_string(), Utc::now().to_rfc3339().into());
    metadata.insert("user_id".to_string(), user_id.into());
    metadata.insert("mime_type".to_string(), mime_type.into());

    NewVideo {
        upload_id: request.upload_id,
        filename: request.filename,
        file_path: path.to_string(),
        file_size: request.size,
        duration: request.duration,
        format: request.format,
        quality: request.quality,
        resolution: request.resolution,
        metadata,
    }
}
