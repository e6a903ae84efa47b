use bytes::Bytes;
use clap::{Parser as ClapParser, Subcommand};
use common::video::{ProcessingOperation, ProcessingRequest, Quality};
use recorder::{create_store, ChunkBuffer, ChunkStore, MediaBlob};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, process};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uploader::config::Settings;
use uploader::{
    into_result, HttpRemote, UploadError, UploadHints, UploadOrchestrator, UploadProgress, UploadStatus,
    VideoTable,
};
use uuid::Uuid;

#[derive(ClapParser, Debug)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "uploader.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a media file through the recording buffer and upload the result
    Record {
        #[arg(short, long)]
        input: String,
        #[arg(short, long, default_value = "video/webm")]
        mime: String,
        /// Recording id, a new one is generated when absent
        #[arg(long)]
        id: Option<String>,
        #[arg(short, long, default_value = "medium")]
        quality: Quality,
    },
    /// Upload a media file as is
    Upload {
        #[arg(short, long)]
        input: String,
        #[arg(short, long, default_value = "video/webm")]
        mime: String,
        #[arg(short, long, default_value = "medium")]
        quality: Quality,
    },
    /// List uploaded videos
    List,
    /// Delete an uploaded video
    Delete {
        #[arg(long)]
        id: Uuid,
    },
    /// Run server-side processing on an uploaded video
    Process {
        #[arg(long)]
        id: Uuid,
        #[arg(long, value_delimiter = ',', default_value = "thumbnail,metadata")]
        operations: Vec<String>,
    },
    /// Remove spilled chunks of abandoned recordings
    Cleanup {
        #[arg(long, value_parser = humantime::parse_duration, default_value = "24h")]
        older_than: Duration,
    },
}

fn main() {
    if let Err(e) = common::logging::init("info") {
        eprintln!("{}", e);
        process::exit(1);
    }

    let cli = Cli::parse();
    let settings = match build_settings(cli.config.as_str()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let runtime = match common::runtime::build("uploader", settings.runtime.threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(settings, cli.command)) {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(settings: Settings, command: Command) -> Result<(), UploadError> {
    let remote = Arc::new(HttpRemote::new(&settings.remote)?);

    match command {
        Command::Record {
            input,
            mime,
            id,
            quality,
        } => record(&settings, remote, &input, &mime, id, quality).await,
        Command::Upload {
            input,
            mime,
            quality,
        } => {
            let data = tokio::fs::read(&input)
                .await
                .map_err(|e| UploadError::StorageError(format!("read {}: {}", input, e)))?;
            let blob = MediaBlob::new(Bytes::from(data), &mime);
            let hints = UploadHints {
                quality,
                ..Default::default()
            };
            upload(&settings, remote, blob, &file_name(&input), hints).await
        }
        Command::List => {
            let videos = remote.list().await?;
            info!("{} videos", videos.len());
            for v in videos {
                println!(
                    "{}\t{}\t{}\t{} bytes\t{}\t{}",
                    v.id,
                    v.created_at.to_rfc3339(),
                    v.status,
                    v.file_size,
                    v.filename,
                    v.file_path
                );
            }
            Ok(())
        }
        Command::Delete { id } => {
            VideoTable::delete(remote.as_ref(), id).await?;
            info!("Video {} deleted", id);
            Ok(())
        }
        Command::Process { id, operations } => {
            let operations = operations
                .iter()
                .map(|op| {
                    serde_json::from_value::<ProcessingOperation>(op.trim().into()).map_err(|_| {
                        UploadError::ConfigError(format!("unknown processing operation: {}", op))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let res = remote
                .process(&ProcessingRequest {
                    video_id: id,
                    operations,
                })
                .await?;
            for r in res.results {
                if r.success {
                    info!("{}: ok {}", r.operation, r.output_path.unwrap_or_default());
                } else {
                    warn!("{}: {}", r.operation, r.error.unwrap_or_default());
                }
            }
            Ok(())
        }
        Command::Cleanup { older_than } => {
            let store = open_store(&settings)?;
            let removed = ChunkBuffer::cleanup_old_chunks(store.as_ref(), older_than)
                .await
                .map_err(|e| UploadError::StorageError(e.to_string()))?;
            info!("{} chunks removed", removed);
            Ok(())
        }
    }
}

/// Replay `input` as a capture source: one chunk per timeslice.
async fn record(
    settings: &Settings,
    remote: Arc<HttpRemote>,
    input: &str,
    mime: &str,
    id: Option<String>,
    quality: Quality,
) -> Result<(), UploadError> {
    let data = tokio::fs::read(input)
        .await
        .map_err(|e| UploadError::StorageError(format!("read {}: {}", input, e)))?;
    let data = Bytes::from(data);

    let recording_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let store = open_store(settings)?;
    let mut buffer = ChunkBuffer::new(&recording_id, settings.buffer.clone(), store);
    buffer.initialize();

    let chunk_bytes = settings.capture.chunk_bytes.max(1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_bytes).min(data.len());
        buffer
            .add_chunk(data.slice(offset..end))
            .await
            .map_err(|e| UploadError::StorageError(e.to_string()))?;
        offset = end;

        if offset < data.len() && !settings.capture.timeslice.is_zero() {
            tokio::time::sleep(settings.capture.timeslice).await;
        }
    }

    let stats = buffer.stats();
    info!(
        "Recording {} captured: {:?}, {} chunks in memory, {} spilled",
        recording_id, stats.duration, stats.chunk_count, stats.spilled_chunks
    );

    let blob = buffer.create_complete_final_blob(mime).await;
    let hints = UploadHints {
        duration: Some(stats.duration.as_secs_f64()),
        quality,
        ..Default::default()
    };
    let filename = format!("recording-{}.{}", recording_id, blob.format());
    match upload(settings, remote, blob, &filename, hints).await {
        Ok(_) => {
            buffer.clear().await;
            Ok(())
        }
        Err(e) => {
            warn!(
                "Recording {} kept in the local store for another attempt",
                recording_id
            );
            Err(e)
        }
    }
}

/// Upload with progress logging; Ctrl-C cancels. A failed or cancelled upload
/// is an error.
async fn upload(
    settings: &Settings,
    remote: Arc<HttpRemote>,
    blob: MediaBlob,
    filename: &str,
    hints: UploadHints,
) -> Result<(), UploadError> {
    let orchestrator = Arc::new(UploadOrchestrator::new(
        settings.upload.clone(),
        remote.clone(),
        remote.clone(),
        remote,
    ));

    let (tx, mut rx) = mpsc::unbounded_channel::<UploadProgress>();
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            match p.status {
                UploadStatus::Error | UploadStatus::Cancelled => warn!(
                    "{} {}: {}",
                    p.upload_id,
                    p.status,
                    p.error.unwrap_or_default()
                ),
                _ => info!(
                    "{} {} {:.1}% ({}/{} bytes, {:.0} B/s)",
                    p.upload_id, p.status, p.percentage, p.loaded, p.total, p.speed
                ),
            }
        }
    });

    let canceller = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            common::systemd::shutdown_signal().await;
            let cancelled = orchestrator.cancel_all_uploads();
            warn!("{} uploads cancelled", cancelled);
        })
    };

    let res = orchestrator
        .upload_video(blob, filename, hints, Some(tx))
        .await;
    canceller.abort();
    let _ = printer.await;

    let res = into_result(res)?;
    info!(
        "Uploaded {} to {}",
        filename,
        res.public_url.unwrap_or_default()
    );
    if let Some(video_id) = res.video_id {
        info!("Video id: {}", video_id);
    }
    Ok(())
}

fn open_store(settings: &Settings) -> Result<Arc<dyn ChunkStore + Send + Sync>, UploadError> {
    create_store(&settings.store).map_err(|e| UploadError::StorageError(e.to_string()))
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn build_settings(config_path: &str) -> Result<Settings, UploadError> {
    let data = fs::read_to_string(config_path).map_err(|_| {
        UploadError::ConfigError(format!("Config file '{}' does not exist", config_path))
    })?;

    toml::from_str(&data)
        .map_err(|e| UploadError::ConfigError(format!("Invalid configuration: {}", e)))
}
