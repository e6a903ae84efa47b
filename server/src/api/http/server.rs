use crate::api::http::service::VaultService;
use crate::errors::ServerError;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Serve `service` on `addr` until `notifier` fires, then wait up to
/// `shutdown_timeout` for open connections to finish.
pub async fn start(
    notifier: Arc<Notify>,
    addr: String,
    max_buffer_size: Option<usize>,
    shutdown_timeout: Duration,
    service: VaultService,
) -> Result<(), ServerError> {
    let addr = common::socket::parse_address(addr)
        .map_err(|e| ServerError::NetworkError(e.to_string()))?;
    let socket = common::socket::listen_reuse_socket(&addr)
        .map_err(|e| ServerError::NetworkError(e.to_string()))?;
    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| ServerError::NetworkError(e.to_string()))?;

    info!("http: listening on http://{}", addr);

    let mut http = http1::Builder::new();
    match max_buffer_size {
        Some(max_buffer_size) if max_buffer_size > 0 => {
            info!("http: max buffer size is set to {}", max_buffer_size);
            http.max_buf_size(max_buffer_size);
        }
        _ => info!("http: max buffer size is default ~400KB"),
    }

    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let mut signal = pin::pin!(notifier.notified());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let service = service.clone();
                let io = TokioIo::new(stream);
                let conn = http.serve_connection(io, service);
                let fut = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        error!("http: downstream: serve: {:?}", e);
                    }
                });
            },
            _ = &mut signal => {
                info!("http: graceful shutdown");
                break;
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => {
            info!("http: all connections gracefully closed");
        },
        _ = tokio::time::sleep(shutdown_timeout) => {
            info!("http: timed out wait for all connections to close");
        }
    }
    Ok(())
}
