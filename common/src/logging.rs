use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides `default_directive`.
pub fn init(default_directive: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| format!("invalid log filter: {}", e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::Layer::default()
                .with_target(false)
                .with_thread_names(false)
                .with_ansi(true)
                .with_line_number(false)
                .with_file(false)
                .with_thread_ids(false),
        )
        .try_init()
        .map_err(|e| format!("Unable to set a global logger instance: {}", e))
}
