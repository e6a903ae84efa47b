use sd_notify::NotifyState;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info};

/// Report readiness to systemd and wake `notifier` waiters on the first
/// shutdown signal.
pub fn run(notifier: Arc<Notify>) {
    tokio::spawn(handle_signals(notifier));
    if let Err(e) = sd_notify::notify(false, &[NotifyState::Ready]) {
        error!("notify ready: {}", e);
    }
}

/// Resolve once SIGINT, SIGTERM or SIGQUIT is received.
pub async fn shutdown_signal() {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("install interrupt handler: {}", e);
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("install terminate handler: {}", e);
            return std::future::pending().await;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!("install quit handler: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => info!("received interrupt signal"),
        _ = terminate.recv() => info!("received terminate signal"),
        _ = quit.recv() => info!("received quit signal"),
    }
}

async fn handle_signals(notifier: Arc<Notify>) {
    shutdown_signal().await;

    let _ = sd_notify::notify(true, &[NotifyState::Stopping]);
    notifier.notify_waiters();
}
