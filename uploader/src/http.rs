use crate::config::RemoteSettings;
use crate::error::UploadError;
use crate::remote::{ObjectStore, Session, VideoTable};
use async_trait::async_trait;
use bytes::Bytes;
use common::video::{
    NewVideo, Principal, ProcessingRequest, ProcessingResponse, VideoRecord,
};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{header, Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::{debug, error};
use uuid::Uuid;

const USER_AGENT: &str = "vault-uploader/1.0";

/// Client of the storage server, one HTTP/1 connection per request.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base: Uri,
    token: String,
    public_base: String,
}

impl HttpRemote {
    pub fn new(settings: &RemoteSettings) -> Result<Self, UploadError> {
        let base = Uri::try_from(settings.url.as_str())
            .map_err(|e| UploadError::ConfigError(format!("Invalid remote URL: {}", e)))?;
        if base.scheme_str() != Some("http") {
            return Err(UploadError::ConfigError(format!(
                "Unsupported remote URL scheme: {}",
                settings.url
            )));
        }
        if base.host().is_none() {
            return Err(UploadError::ConfigError(format!(
                "Remote URL has no host: {}",
                settings.url
            )));
        }

        let public_base = settings
            .public_url
            .clone()
            .unwrap_or_else(|| settings.url.clone())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            base,
            token: settings.token.clone(),
            public_base,
        })
    }

    fn build_uri(&self, path: &str) -> Result<Uri, UploadError> {
        let prefix = self.base.path().trim_end_matches('/');
        let pnq = format!("{}/{}", prefix, path.trim_start_matches('/'));

        Uri::builder()
            .scheme(self.base.scheme_str().unwrap_or("http"))
            .authority(self.base.authority().map(|a| a.as_str()).unwrap_or_default())
            .path_and_query(pnq)
            .build()
            .map_err(|e| UploadError::RequestError(format!("build uri: {}", e)))
    }

    async fn connect(&self) -> Result<http1::SendRequest<Full<Bytes>>, UploadError> {
        let host = self.base.host().unwrap_or("localhost");
        let port = self.base.port_u16().unwrap_or(80);
        let addr = format!("{}:{}", host, port);
        let tcp_stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|e| UploadError::NetworkError(format!("connect to {}: {}", addr, e)))?;

        let (sender, conn) = http1::handshake(TokioIo::new(tcp_stream))
            .await
            .map_err(|e| UploadError::NetworkError(format!("http1 handshake: {}", e)))?;
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                error!("connection: {:?}", err);
            }
        });

        Ok(sender)
    }

    /// Send one request and return the status and collected body.
    /// 401 maps to `AuthError`, 5xx to a retryable `NetworkError`,
    /// any other non-success status to `RequestError`.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<Bytes, UploadError> {
        let uri = self.build_uri(path)?;
        let mut sender = self.connect().await?;

        let mut req = Request::builder()
            .method(method.clone())
            .uri(uri.clone())
            .header(header::HOST, self.base.authority().map(|a| a.as_str()).unwrap_or_default())
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::CONTENT_LENGTH, body.len());
        if let Some(content_type) = content_type {
            req = req.header(header::CONTENT_TYPE, content_type);
        }
        let req = req
            .body(Full::new(body))
            .map_err(|e| UploadError::RequestError(format!("build request: {}", e)))?;

        let res = sender
            .send_request(req)
            .await
            .map_err(|e| UploadError::NetworkError(format!("send request: {}", e)))?;
        let status = res.status();
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| UploadError::NetworkError(format!("read response: {}", e)))?
            .to_bytes();
        debug!("{} {}: {}", method, uri, status);

        if status.is_success() {
            return Ok(body);
        }

        let message = String::from_utf8_lossy(&body).to_string();
        match status {
            StatusCode::UNAUTHORIZED => Err(UploadError::AuthError(message)),
            s if s.is_server_error() => {
                Err(UploadError::NetworkError(format!("{}: {}", s, message)))
            }
            s => Err(UploadError::RequestError(format!("{}: {}", s, message))),
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, UploadError> {
        let content_type = body.as_ref().map(|_| "application/json");
        let body = Bytes::from(body.unwrap_or_default());
        let res = self.send(method, path, body, content_type).await?;
        serde_json::from_slice(&res)
            .map_err(|e| UploadError::RequestError(format!("decode response: {}", e)))
    }

    /// Run server-side processing for one of the user's videos
    pub async fn process(
        &self,
        request: &ProcessingRequest,
    ) -> Result<ProcessingResponse, UploadError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| UploadError::RequestError(format!("encode request: {}", e)))?;
        self.send_json(Method::POST, "process", Some(body)).await
    }
}

#[async_trait]
impl Session for HttpRemote {
    async fn current_user(&self) -> Result<Option<Principal>, UploadError> {
        match self.send_json(Method::GET, "auth/user", None).await {
            Ok(principal) => Ok(Some(principal)),
            Err(UploadError::AuthError(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpRemote {
    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), UploadError> {
        let path = format!("storage/{}", path);
        self.send(Method::PUT, &path, data, Some(content_type)).await?;
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/storage/{}", self.public_base, path)
    }

    async fn delete(&self, path: &str) -> Result<(), UploadError> {
        let path = format!("storage/{}", path);
        self.send(Method::DELETE, &path, Bytes::new(), None).await?;
        Ok(())
    }
}

#[async_trait]
impl VideoTable for HttpRemote {
    async fn insert(&self, video: &NewVideo) -> Result<VideoRecord, UploadError> {
        let body = serde_json::to_vec(video)
            .map_err(|e| UploadError::RequestError(format!("encode row: {}", e)))?;
        self.send_json(Method::POST, "rest/videos", Some(body)).await
    }

    async fn list(&self) -> Result<Vec<VideoRecord>, UploadError> {
        self.send_json(Method::GET, "rest/videos", None).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), UploadError> {
        let path = format!("rest/videos/{}", id);
        self.send(Method::DELETE, &path, Bytes::new(), None).await?;
        Ok(())
    }
}
