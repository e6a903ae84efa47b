use crate::auth::Authenticator;
use crate::errors::ServerError;
use crate::processing::Processor;
use crate::storage::{self, FileStorage};
use crate::table::VideoTable;
use bytes::Bytes;
use common::video::{NewVideo, Principal, ProcessingRequest, ProcessingResponse, VideoStatus};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{header, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMON_HEADERS: [(header::HeaderName, &str); 1] =
    [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")];

type HttpResponse = Response<BoxBody<Bytes, Infallible>>;

#[derive(Debug, PartialEq)]
enum Route {
    AuthUser,
    Object(String),
    Videos,
    Video(Uuid),
    Process,
    NotFound,
}

impl Route {
    fn from_path(path: &str) -> Self {
        let path = path.trim_start_matches('/');
        if path == "auth/user" {
            return Route::AuthUser;
        }
        if path == "process" {
            return Route::Process;
        }
        if let Some(object) = path.strip_prefix("storage/") {
            return Route::Object(object.to_string());
        }

        match path.trim_end_matches('/').strip_prefix("rest/videos") {
            Some("") => Route::Videos,
            Some(rest) => match rest.strip_prefix('/').map(Uuid::parse_str) {
                Some(Ok(id)) => Route::Video(id),
                _ => Route::NotFound,
            },
            None => Route::NotFound,
        }
    }
}

/// Storage, video table and processing API
#[derive(Clone)]
pub struct VaultService {
    auth: Arc<Authenticator>,
    storage: FileStorage,
    table: Arc<VideoTable>,
    processor: Arc<Processor>,
}

impl VaultService {
    pub fn new(
        auth: Arc<Authenticator>,
        storage: FileStorage,
        table: Arc<VideoTable>,
        processor: Arc<Processor>,
    ) -> Self {
        VaultService {
            auth,
            storage,
            table,
            processor,
        }
    }

    async fn handle<B>(&self, req: Request<B>) -> Result<HttpResponse, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let principal = self.auth.authenticate(req.headers());

        let res = self.route(req, principal).await;
        let response = match res {
            Ok(response) => response,
            Err(e) => {
                let status = error_status(&e);
                if status.is_server_error() {
                    error!("{} {}: {}", method, path, e);
                } else {
                    debug!("{} {}: {}", method, path, e);
                }
                error_response(status, &e.to_string())
            }
        };

        debug!("{} {}: {}", method, path, response.status());
        Ok(response)
    }

    async fn route<B>(
        &self,
        req: Request<B>,
        principal: Option<Principal>,
    ) -> Result<HttpResponse, ServerError>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let route = Route::from_path(req.uri().path());

        // objects are publicly readable, everything else needs a user
        if let (&Method::GET, Route::Object(path)) = (req.method(), &route) {
            return self.get_object(path).await;
        }
        if route == Route::NotFound {
            return Ok(empty_response(StatusCode::NOT_FOUND));
        }
        let Some(principal) = principal else {
            return Ok(error_response(StatusCode::UNAUTHORIZED, "Unauthorized"));
        };

        match (req.method().clone(), route) {
            (Method::GET, Route::AuthUser) => Ok(json_response(StatusCode::OK, &principal)),
            (Method::PUT, Route::Object(path)) => {
                let body = read_body(req).await?;
                self.put_object(&principal, &path, body).await
            }
            (Method::DELETE, Route::Object(path)) => self.delete_object(&principal, &path).await,
            (Method::GET, Route::Videos) => Ok(json_response(
                StatusCode::OK,
                &self.table.list(&principal.id),
            )),
            (Method::POST, Route::Videos) => {
                let body = read_body(req).await?;
                self.insert_video(&principal, body).await
            }
            (Method::GET, Route::Video(id)) => match self.table.get(&principal.id, id) {
                Some(video) => Ok(json_response(StatusCode::OK, &video)),
                None => Err(ServerError::NotFound(format!("video {}", id))),
            },
            (Method::DELETE, Route::Video(id)) => self.delete_video(&principal, id).await,
            (Method::POST, Route::Process) => {
                let body = read_body(req).await?;
                self.process(&principal, body).await
            }
            _ => Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED)),
        }
    }

    async fn get_object(&self, path: &str) -> Result<HttpResponse, ServerError> {
        match self.storage.read_file(path).await? {
            Some(data) => {
                let mut response = Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, storage::content_type(path))
                    .header(header::CONTENT_LENGTH, data.len());
                for header in COMMON_HEADERS {
                    response = response.header(header.0, header.1);
                }
                build(response, Full::new(data).boxed())
            }
            None => Err(ServerError::NotFound(path.to_string())),
        }
    }

    async fn put_object(
        &self,
        principal: &Principal,
        path: &str,
        body: Bytes,
    ) -> Result<HttpResponse, ServerError> {
        storage::validate_path(path)?;
        if !path.starts_with(&format!("videos/{}/", principal.id)) {
            return Err(ServerError::Forbidden(format!(
                "{} is outside the user's folder",
                path
            )));
        }

        let size = body.len();
        self.storage.write_file(path, body).await?;
        info!("Stored {} ({} bytes) for {}", path, size, principal.id);
        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "path": path }),
        ))
    }

    async fn delete_object(
        &self,
        principal: &Principal,
        path: &str,
    ) -> Result<HttpResponse, ServerError> {
        let own = [
            format!("videos/{}/", principal.id),
            format!("thumbnails/{}/", principal.id),
        ];
        if !own.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return Err(ServerError::Forbidden(format!(
                "{} is outside the user's folder",
                path
            )));
        }

        if self.storage.delete_file(path).await? {
            info!("Deleted {} for {}", path, principal.id);
            Ok(empty_response(StatusCode::NO_CONTENT))
        } else {
            Err(ServerError::NotFound(path.to_string()))
        }
    }

    async fn insert_video(
        &self,
        principal: &Principal,
        body: Bytes,
    ) -> Result<HttpResponse, ServerError> {
        let video: NewVideo = serde_json::from_slice(&body)
            .map_err(|e| ServerError::RequestError(format!("Invalid video row: {}", e)))?;
        let record = self.table.insert(&principal.id, video).await?;
        info!(
            "Registered video {} ({}) for {}",
            record.id, record.file_path, principal.id
        );
        Ok(json_response(StatusCode::CREATED, &record))
    }

    async fn delete_video(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<HttpResponse, ServerError> {
        let Some(video) = self.table.delete(&principal.id, id).await? else {
            return Err(ServerError::NotFound(format!("video {}", id)));
        };

        let mut paths = vec![video.file_path.clone()];
        paths.extend(video.thumbnail_path.clone());
        for path in paths {
            if let Err(e) = self.storage.delete_file(&path).await {
                warn!("Video {}: failed to delete {}: {}", id, path, e);
            }
        }

        info!("Deleted video {} for {}", id, principal.id);
        Ok(empty_response(StatusCode::NO_CONTENT))
    }

    async fn process(
        &self,
        principal: &Principal,
        body: Bytes,
    ) -> Result<HttpResponse, ServerError> {
        let request: ProcessingRequest = serde_json::from_slice(&body)
            .map_err(|e| ServerError::RequestError(format!("Invalid processing request: {}", e)))?;
        let id = request.video_id;

        let video = self
            .table
            .update(&principal.id, id, |v| v.status = VideoStatus::Processing)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("video {}", id)))?;
        info!(
            "Processing video {}: {:?}",
            id, request.operations
        );

        let outcome = self.processor.run(&video, &request.operations).await;
        self.table
            .update(&principal.id, id, |v| outcome.apply(v))
            .await?;

        Ok(json_response(
            StatusCode::OK,
            &ProcessingResponse {
                video_id: id,
                success: outcome.success(),
                results: outcome.results,
            },
        ))
    }
}

impl Service<Request<Incoming>> for VaultService {
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.handle(req).await })
    }
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes, ServerError>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ServerError::NetworkError(format!("Failed to read request body: {}", e)))
}

fn error_status(e: &ServerError) -> StatusCode {
    match e {
        ServerError::RequestError(_) => StatusCode::BAD_REQUEST,
        ServerError::NotFound(_) => StatusCode::NOT_FOUND,
        ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
        ServerError::NetworkError(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn build(
    response: hyper::http::response::Builder,
    body: BoxBody<Bytes, Infallible>,
) -> Result<HttpResponse, ServerError> {
    response
        .body(body)
        .map_err(|e| ServerError::RequestError(format!("Failed to build response: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    let data = match serde_json::to_vec(value) {
        Ok(data) => data,
        Err(e) => {
            error!("encode response: {}", e);
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    for header in COMMON_HEADERS {
        response = response.header(header.0, header.1);
    }
    match response.body(Full::new(Bytes::from(data)).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!("build response: {}", e);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    json_response(status, &serde_json::json!({ "error": message }))
}

fn empty_response(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(BoxBody::default());
    *response.status_mut() = status;
    for header in COMMON_HEADERS {
        response
            .headers_mut()
            .insert(header.0, header::HeaderValue::from_static(header.1));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Processing;
    use common::video::{OperationResult, ProcessingOperation, VideoRecord};
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn service() -> (TempDir, VaultService) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_str().unwrap());
        let table = VideoTable::open(dir.path().join("videos.json")).await.unwrap();
        let processing = Processing {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ffprobe: "/nonexistent/ffprobe".to_string(),
            ..Default::default()
        };
        let auth = Authenticator::new(HashMap::from([
            ("alice-token".to_string(), "alice".to_string()),
            ("bob-token".to_string(), "bob".to_string()),
        ]));
        let service = VaultService::new(
            Arc::new(auth),
            storage.clone(),
            Arc::new(table),
            Arc::new(Processor::new(processing, storage)),
        );
        (dir, service)
    }

    async fn call(
        service: &VaultService,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: &[u8],
    ) -> (StatusCode, Bytes) {
        let mut req = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = req.body(Full::new(Bytes::copy_from_slice(body))).unwrap();

        let res = service.handle(req).await.unwrap();
        let status = res.status();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    fn new_video(path: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "upload_id": "upload_1",
            "filename": "a.webm",
            "file_path": path,
            "file_size": 3,
            "format": "webm",
            "metadata": { "mime_type": "video/webm" }
        }))
        .unwrap()
    }

    #[test]
    fn routes() {
        let id = Uuid::new_v4();
        assert_eq!(Route::from_path("/auth/user"), Route::AuthUser);
        assert_eq!(Route::from_path("/process"), Route::Process);
        assert_eq!(
            Route::from_path("/storage/videos/u/a.webm"),
            Route::Object("videos/u/a.webm".to_string())
        );
        assert_eq!(Route::from_path("/rest/videos"), Route::Videos);
        assert_eq!(Route::from_path("/rest/videos/"), Route::Videos);
        assert_eq!(
            Route::from_path(&format!("/rest/videos/{}", id)),
            Route::Video(id)
        );
        assert_eq!(Route::from_path("/rest/videos/not-a-uuid"), Route::NotFound);
        assert_eq!(Route::from_path("/rest/videosx"), Route::NotFound);
        assert_eq!(Route::from_path("/"), Route::NotFound);
    }

    #[tokio::test]
    async fn current_user_needs_a_token() {
        let (_dir, service) = service().await;

        let (status, body) = call(&service, Method::GET, "/auth/user", Some("alice-token"), b"").await;
        assert_eq!(status, StatusCode::OK);
        let principal: Principal = serde_json::from_slice(&body).unwrap();
        assert_eq!(principal.id, "alice");

        let (status, _) = call(&service, Method::GET, "/auth/user", Some("nope"), b"").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&service, Method::GET, "/auth/user", None, b"").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn objects_live_under_the_owner_folder() {
        let (_dir, service) = service().await;

        let (status, _) = call(
            &service,
            Method::PUT,
            "/storage/videos/alice/a.webm",
            Some("alice-token"),
            b"abc",
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &service,
            Method::PUT,
            "/storage/videos/bob/a.webm",
            Some("alice-token"),
            b"abc",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &service,
            Method::PUT,
            "/storage/videos/alice/../bob/a.webm",
            Some("alice-token"),
            b"abc",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&service, Method::GET, "/storage/videos/alice/a.webm", None, b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"abc");

        let (status, _) = call(
            &service,
            Method::DELETE,
            "/storage/videos/alice/a.webm",
            Some("bob-token"),
            b"",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &service,
            Method::DELETE,
            "/storage/videos/alice/a.webm",
            Some("alice-token"),
            b"",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&service, Method::GET, "/storage/videos/alice/a.webm", None, b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn video_rows_are_private() {
        let (_dir, service) = service().await;

        let (status, body) = call(
            &service,
            Method::POST,
            "/rest/videos",
            Some("alice-token"),
            &new_video("videos/alice/a.webm"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let record: VideoRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.status, VideoStatus::Uploaded);
        assert_eq!(record.metadata["mime_type"], "video/webm");

        let (_, body) = call(&service, Method::GET, "/rest/videos", Some("bob-token"), b"").await;
        let rows: Vec<VideoRecord> = serde_json::from_slice(&body).unwrap();
        assert!(rows.is_empty());

        let path = format!("/rest/videos/{}", record.id);
        let (status, _) = call(&service, Method::GET, &path, Some("bob-token"), b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&service, Method::DELETE, &path, Some("bob-token"), b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&service, Method::GET, &path, Some("alice-token"), b"").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&service, Method::POST, "/rest/videos", Some("alice-token"), b"{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deleting_a_row_removes_its_object() {
        let (_dir, service) = service().await;

        call(
            &service,
            Method::PUT,
            "/storage/videos/alice/a.webm",
            Some("alice-token"),
            b"abc",
        )
        .await;
        let (_, body) = call(
            &service,
            Method::POST,
            "/rest/videos",
            Some("alice-token"),
            &new_video("videos/alice/a.webm"),
        )
        .await;
        let record: VideoRecord = serde_json::from_slice(&body).unwrap();

        let path = format!("/rest/videos/{}", record.id);
        let (status, _) = call(&service, Method::DELETE, &path, Some("alice-token"), b"").await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&service, Method::GET, "/storage/videos/alice/a.webm", None, b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, body) = call(&service, Method::GET, "/rest/videos", Some("alice-token"), b"").await;
        let rows: Vec<VideoRecord> = serde_json::from_slice(&body).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn failed_processing_marks_the_row() {
        let (_dir, service) = service().await;

        let (_, body) = call(
            &service,
            Method::POST,
            "/rest/videos",
            Some("alice-token"),
            &new_video("videos/alice/a.webm"),
        )
        .await;
        let record: VideoRecord = serde_json::from_slice(&body).unwrap();

        let request = serde_json::to_vec(&ProcessingRequest {
            video_id: record.id,
            operations: vec![ProcessingOperation::Compress],
        })
        .unwrap();

        let (status, _) = call(&service, Method::POST, "/process", Some("bob-token"), &request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&service, Method::POST, "/process", Some("alice-token"), &request).await;
        assert_eq!(status, StatusCode::OK);
        let res: ProcessingResponse = serde_json::from_slice(&body).unwrap();
        assert!(!res.success);
        let result: &OperationResult = &res.results[0];
        assert_eq!(result.operation, ProcessingOperation::Compress);
        assert!(!result.success);

        let path = format!("/rest/videos/{}", record.id);
        let (_, body) = call(&service, Method::GET, &path, Some("alice-token"), b"").await;
        let row: VideoRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(row.status, VideoStatus::Error);
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_routes_and_methods() {
        let (_dir, service) = service().await;

        let (status, _) = call(&service, Method::GET, "/nothing", Some("alice-token"), b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&service, Method::PATCH, "/rest/videos", Some("alice-token"), b"").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
