use crate::config::Processing;
use crate::errors::ServerError;
use crate::storage::FileStorage;
use chrono::Utc;
use common::video::{OperationResult, ProcessingOperation, Resolution, VideoRecord, VideoStatus};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Runs processing operations on stored videos with ffmpeg and ffprobe.
#[derive(Debug, Clone)]
pub struct Processor {
    settings: Processing,
    storage: FileStorage,
}

/// What a processing run learned about a video
#[derive(Debug, Default)]
pub struct ProcessingOutcome {
    pub results: Vec<OperationResult>,
    pub thumbnail_path: Option<String>,
    pub probe: Option<ProbeFacts>,
}

impl ProcessingOutcome {
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    /// Fold the outcome into the row and settle its status.
    pub fn apply(&self, video: &mut VideoRecord) {
        if let Some(path) = &self.thumbnail_path {
            video.thumbnail_path = Some(path.clone());
        }

        if let Some(probe) = &self.probe {
            if probe.duration.is_some() {
                video.duration = probe.duration;
            }
            if probe.resolution.is_some() {
                video.resolution = probe.resolution;
            }
            for (k, v) in probe.metadata.iter() {
                video.metadata.insert(k.clone(), v.clone());
            }
        }

        video.status = if self.success() {
            VideoStatus::Processed
        } else {
            VideoStatus::Error
        };
        video.processed_at = Some(Utc::now());
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProbeFacts {
    pub duration: Option<f64>,
    pub resolution: Option<Resolution>,
    pub metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl Processor {
    pub fn new(settings: Processing, storage: FileStorage) -> Self {
        Self { settings, storage }
    }

    pub fn thumbnail_path(video: &VideoRecord) -> String {
        format!("thumbnails/{}/{}.jpg", video.user_id, video.id)
    }

    /// Run `operations` in order. Every operation reports its own result,
    /// a failing one does not stop the rest.
    pub async fn run(
        &self,
        video: &VideoRecord,
        operations: &[ProcessingOperation],
    ) -> ProcessingOutcome {
        let mut outcome = ProcessingOutcome::default();

        for operation in operations {
            let res = match operation {
                ProcessingOperation::Thumbnail => self.thumbnail(video).await.map(|path| {
                    outcome.thumbnail_path = Some(path.clone());
                    Some(path)
                }),
                ProcessingOperation::Metadata => self.metadata(video).await.map(|probe| {
                    outcome.probe = Some(probe);
                    None
                }),
                ProcessingOperation::Compress | ProcessingOperation::FormatConvert => Err(
                    ServerError::ProcessingError(format!("{} is not implemented", operation)),
                ),
            };

            let result = match res {
                Ok(output_path) => {
                    info!("Video {}: {} done", video.id, operation);
                    OperationResult {
                        operation: *operation,
                        success: true,
                        output_path,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!("Video {}: {} failed: {}", video.id, operation, e);
                    OperationResult {
                        operation: *operation,
                        success: false,
                        output_path: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcome.results.push(result);
        }

        outcome
    }

    async fn thumbnail(&self, video: &VideoRecord) -> Result<String, ServerError> {
        let input = self.storage.full_path(&video.file_path)?;
        let relative = Self::thumbnail_path(video);
        let output = self.storage.full_path(&relative)?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ServerError::StorageError(format!("Failed to create directory: {}", e))
            })?;
        }

        // seek inside short clips
        let at = match video.duration {
            Some(d) if d > 0.0 => self.settings.thumbnail_at.min(d / 2.0),
            _ => self.settings.thumbnail_at,
        };

        let cmd = self.build_thumbnail_command(&input, &output, at);
        execute(cmd).await?;

        if tokio::fs::metadata(&output).await.is_err() {
            return Err(ServerError::ProcessingError(
                "ffmpeg produced no frame".to_string(),
            ));
        }
        Ok(relative)
    }

    async fn metadata(&self, video: &VideoRecord) -> Result<ProbeFacts, ServerError> {
        let input = self.storage.full_path(&video.file_path)?;
        let cmd = self.build_probe_command(&input);
        let stdout = execute(cmd).await?;
        parse_probe(&stdout)
    }

    /// Extract one frame scaled to the configured width.
    pub fn build_thumbnail_command(&self, input: &Path, output: &Path, at: f64) -> Command {
        let mut cmd = Command::new(&self.settings.ffmpeg);
        cmd.arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-ss")
            .arg(format!("{:.3}", at))
            .arg("-i")
            .arg(input)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg(format!("scale={}:-2", self.settings.thumbnail_width))
            .arg(output);
        cmd
    }

    pub fn build_probe_command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.ffprobe);
        cmd.arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(input);
        cmd
    }
}

async fn execute(mut cmd: Command) -> Result<Vec<u8>, ServerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!("exec: {:?}", cmd);

    let program = cmd.get_program().to_string_lossy().to_string();
    let output = tokio::process::Command::from(cmd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ServerError::ProcessingError(format!("Failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ServerError::ProcessingError(format!(
            "{} {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Pick the facts worth keeping out of `ffprobe -print_format json` output.
pub fn parse_probe(data: &[u8]) -> Result<ProbeFacts, ServerError> {
    let probe: ProbeOutput = serde_json::from_slice(data)
        .map_err(|e| ServerError::ProcessingError(format!("Invalid ffprobe output: {}", e)))?;

    let mut facts = ProbeFacts::default();

    if let Some(format) = probe.format {
        facts.duration = format.duration.as_deref().and_then(|d| d.parse().ok());
        if let Some(name) = format.format_name {
            facts.metadata.insert("container".to_string(), Value::from(name));
        }
        if let Some(bit_rate) = format.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok()) {
            facts.metadata.insert("bit_rate".to_string(), Value::from(bit_rate));
        }
    }

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    if let Some(stream) = video {
        if let (Some(width), Some(height)) = (stream.width, stream.height) {
            facts.resolution = Some(Resolution { width, height });
        }
        if let Some(codec) = &stream.codec_name {
            facts
                .metadata
                .insert("video_codec".to_string(), Value::from(codec.clone()));
        }
        if let Some(fps) = stream.avg_frame_rate.as_deref().and_then(frame_rate) {
            facts.metadata.insert("frame_rate".to_string(), Value::from(fps));
        }
    }

    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));
    if let Some(codec) = audio.and_then(|s| s.codec_name.clone()) {
        facts
            .metadata
            .insert("audio_codec".to_string(), Value::from(codec));
    }

    Ok(facts)
}

/// "30000/1001" -> 29.97
fn frame_rate(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some((num / den * 100.0).round() / 100.0)
}
