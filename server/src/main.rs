mod api;
mod auth;
mod config;
mod errors;
mod processing;
mod storage;
mod table;

use crate::api::http::service::VaultService;
use crate::auth::Authenticator;
use crate::config::Setting;
use crate::errors::ServerError;
use crate::processing::Processor;
use crate::storage::FileStorage;
use crate::table::VideoTable;
use clap::Parser as ClapParser;
use std::fs;
use std::process;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(ClapParser, Debug)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    #[arg(short, long)]
    buffer: Option<usize>,
}

fn main() {
    if let Err(e) = common::logging::init("info") {
        eprintln!("{}", e);
        process::exit(1);
    }

    let args = Cli::parse();
    let setting = match setting(&args) {
        Ok(setting) => setting,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let runtime = match common::runtime::build("server", setting.runtime.threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(start(setting, args.buffer)) {
        error!("{}", e);
        process::exit(1);
    }

    info!("done");
}

fn setting(args: &Cli) -> Result<Setting, ServerError> {
    let data = fs::read_to_string(args.config.as_str()).map_err(|_| {
        ServerError::ConfigError(format!("config file '{}' does not exist", args.config))
    })?;

    toml::from_str(data.as_str())
        .map_err(|e| ServerError::ConfigError(format!("invalid configuration: {}", e)))
}

async fn start(setting: Setting, buffer: Option<usize>) -> Result<(), ServerError> {
    let storage = FileStorage::new(&setting.storage.path);
    tokio::fs::create_dir_all(storage.base_path())
        .await
        .map_err(|e| ServerError::StorageError(format!("Failed to create storage root: {}", e)))?;
    info!("storage: {}", storage.base_path().display());

    let table = Arc::new(VideoTable::open(storage.base_path().join("videos.json")).await?);

    let tokens = setting.auth.token_map();
    if tokens.is_empty() {
        warn!("no auth tokens configured, only public reads will succeed");
    }
    let auth = Arc::new(Authenticator::new(tokens));
    let processor = Arc::new(Processor::new(setting.processing.clone(), storage.clone()));
    let service = VaultService::new(auth, storage, table, processor);

    let notifier = Arc::new(Notify::new());
    common::systemd::run(notifier.clone());

    let max_buffer_size = buffer.or(setting.http.max_buffer_size);
    api::http::server::start(
        notifier,
        setting.http.addr.clone(),
        max_buffer_size,
        setting.http.shutdown_timeout,
        service,
    )
    .await
}
