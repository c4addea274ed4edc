//! Video conversion using ffmpeg.
//!
//! Proprietary containers are transcoded off the request path by a small
//! worker pool fed through a bounded queue. The original file is never
//! touched: ffmpeg writes into the scratch area, the output is checked, and
//! only then placed next to the original.

use super::models::{ConversionJob, ConversionStatus, UploadStatus};
use super::progress::{ProgressTracker, SessionUpdate};
use super::store::{AssetStore, StorageError};
use crate::server::metrics;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How much of ffmpeg's stderr is kept in error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Errors that can occur during conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Transcoder not available: {0}")]
    ToolMissing(String),

    #[error("Transcoder failed ({status}): {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("Transcoder produced no output for {0}")]
    EmptyOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to place converted file: {0}")]
    Storage(#[from] StorageError),

    #[error("Conversion queue is full")]
    QueueFull,

    #[error("Conversion queue is closed")]
    QueueClosed,
}

impl ConversionError {
    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolMissing(_) => "tool_missing",
            Self::ToolFailed { .. } => "tool_failed",
            Self::EmptyOutput(_) => "empty_output",
            Self::Io(_) | Self::Storage(_) => "io",
            Self::QueueFull => "queue_full",
            Self::QueueClosed => "queue_closed",
        }
    }
}

/// Conversion settings.
#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub enabled: bool,
    pub ffmpeg_path: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    /// Extension of the converted file, without the dot.
    pub target_extension: String,
    pub max_concurrent: usize,
    pub queue_size: usize,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            target_extension: "mp4".to_string(),
            max_concurrent: 2,
            queue_size: 64,
        }
    }
}

/// Something that turns `source` into a playable file at `target`.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, source: &Path, target: &Path) -> Result<(), ConversionError>;
}

/// ffmpeg subprocess transcoder.
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
    video_codec: String,
    audio_codec: String,
    /// Whether the binary could be started, probed once on first use.
    available: OnceCell<bool>,
}

impl FfmpegTranscoder {
    pub fn new(settings: &ConversionSettings) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            video_codec: settings.video_codec.clone(),
            audio_codec: settings.audio_codec.clone(),
            available: OnceCell::new(),
        }
    }

    /// Check that the binary exists and runs. Only the first call spawns a
    /// process.
    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let result = Command::new(&self.ffmpeg_path)
                    .arg("-version")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;
                match result {
                    Ok(status) if status.success() => {
                        info!("Using transcoder at {:?}", self.ffmpeg_path);
                        true
                    }
                    Ok(status) => {
                        warn!(
                            "Transcoder {:?} exited with {} on -version, conversions disabled",
                            self.ffmpeg_path, status
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            "Transcoder {:?} not found ({}), conversions disabled",
                            self.ffmpeg_path, e
                        );
                        false
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, source: &Path, target: &Path) -> Result<(), ConversionError> {
        if !self.is_available().await {
            return Err(ConversionError::ToolMissing(
                self.ffmpeg_path.display().to_string(),
            ));
        }

        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-y", "-i"])
            .arg(source)
            .args([
                "-c:v",
                self.video_codec.as_str(),
                "-c:a",
                self.audio_codec.as_str(),
                "-movflags",
                "+faststart",
            ])
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ConversionError::ToolMissing(self.ffmpeg_path.display().to_string())
                }
                _ => ConversionError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            let tail = stderr
                .get(start..)
                .unwrap_or(&stderr)
                .trim()
                .to_string();
            return Err(ConversionError::ToolFailed {
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        Ok(())
    }
}

/// Runs a single conversion job end to end.
pub struct ConversionWorker {
    transcoder: Arc<dyn Transcoder>,
    store: Arc<AssetStore>,
}

impl ConversionWorker {
    pub fn new(transcoder: Arc<dyn Transcoder>, store: Arc<AssetStore>) -> Self {
        Self { transcoder, store }
    }

    /// Transcode `job.source_path` and place the result. Returns the final
    /// path of the converted file.
    pub async fn convert(&self, job: &ConversionJob) -> Result<PathBuf, ConversionError> {
        let ext = job
            .target_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let temp = tempfile::Builder::new()
            .prefix(".convert-")
            .suffix(&format!(".{}", ext))
            .tempfile_in(self.store.scratch().dir())?
            .into_temp_path();

        self.transcoder.transcode(&job.source_path, &temp).await?;

        let size = tokio::fs::metadata(&temp).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(ConversionError::EmptyOutput(job.source_path.clone()));
        }

        let name = job
            .target_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("converted.mp4")
            .to_string();
        let path = self
            .store
            .place_converted(&job.fingerprint, temp, &name)
            .await?;
        Ok(path)
    }
}

/// Bounded job queue in front of the worker pool.
#[derive(Clone)]
pub struct ConversionQueue {
    tx: mpsc::Sender<ConversionJob>,
}

impl ConversionQueue {
    /// Spawn the worker pool and return the queue feeding it.
    ///
    /// Jobs still queued or running when `shutdown` fires are reported as
    /// failed and their ffmpeg processes are killed.
    pub fn start(
        worker: ConversionWorker,
        tracker: Arc<ProgressTracker>,
        settings: &ConversionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let queue_size = settings.queue_size.max(1);
        let max_concurrent = settings.max_concurrent.max(1);
        let (tx, rx) = mpsc::channel(queue_size);

        tokio::spawn(worker_pool(
            rx,
            Arc::new(worker),
            tracker,
            max_concurrent,
            shutdown,
        ));

        info!(
            "Conversion queue started (queue size {}, {} workers)",
            queue_size, max_concurrent
        );
        Self { tx }
    }

    /// Enqueue without waiting. Fails when the queue is full or the pool is gone.
    pub fn submit(&self, job: ConversionJob) -> Result<(), ConversionError> {
        debug!("Enqueuing conversion job {} for {:?}", job.id, job.source_path);
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Conversion queue is full, rejecting job");
                ConversionError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => ConversionError::QueueClosed,
        })
    }
}

async fn worker_pool(
    mut rx: mpsc::Receiver<ConversionJob>,
    worker: Arc<ConversionWorker>,
    tracker: Arc<ProgressTracker>,
    max_concurrent: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                finish_cancelled(&tracker, &job);
                break;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker = worker.clone();
        let tracker = tracker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = shutdown.cancelled() => finish_cancelled(&tracker, &job),
                _ = process_job(&worker, &tracker, job.clone()) => {}
            }
        });
    }

    // Anything still queued will never run
    rx.close();
    while let Ok(job) = rx.try_recv() {
        finish_cancelled(&tracker, &job);
    }
    debug!("Conversion worker pool stopped");
}

async fn process_job(worker: &ConversionWorker, tracker: &ProgressTracker, mut job: ConversionJob) {
    let start = Instant::now();
    job.status = ConversionStatus::Running;
    tracker.report(&job.session_id, SessionUpdate::conversion(job.status));
    info!("Converting {:?} (job {})", job.source_path, job.id);

    match worker.convert(&job).await {
        Ok(path) => {
            job.status = ConversionStatus::Succeeded;
            info!(
                "Converted {:?} to {:?} in {:.1}s",
                job.source_path,
                path,
                start.elapsed().as_secs_f64()
            );
            metrics::record_conversion("succeeded", start.elapsed());
            tracker.report(
                &job.session_id,
                SessionUpdate::conversion(job.status).with_status(UploadStatus::Done),
            );
        }
        Err(e) => {
            job.status = ConversionStatus::Failed;
            match &e {
                ConversionError::ToolMissing(_) => {
                    warn!("Conversion of {:?} skipped: {}", job.source_path, e)
                }
                ConversionError::Storage(_) | ConversionError::Io(_) => {
                    error!("Conversion of {:?} failed: {}", job.source_path, e)
                }
                _ => warn!("Conversion of {:?} failed: {}", job.source_path, e),
            }
            metrics::record_conversion(e.kind(), start.elapsed());
            tracker.report(
                &job.session_id,
                SessionUpdate::conversion_failed(e.to_string()).with_status(UploadStatus::Done),
            );
        }
    }
}

fn finish_cancelled(tracker: &ProgressTracker, job: &ConversionJob) {
    metrics::record_conversion("cancelled", std::time::Duration::ZERO);
    tracker.report(
        &job.session_id,
        SessionUpdate::conversion_failed("Conversion cancelled by shutdown")
            .with_status(UploadStatus::Done),
    );
}
