//! Per-upload orchestration.
//!
//! Drives one upload through RECEIVING -> VALIDATING -> DUPLICATE | STORING
//! -> DONE | CONVERTING, recording every step in the progress tracker. Any
//! error moves the session to FAILED with a stable error code. The
//! coordinator itself keeps no state beyond handles to its collaborators.

use super::converter::{ConversionError, ConversionQueue};
use super::file_handler::{
    classify_content_type, generate_filename, sanitize_filename, BodyKind, ValidationError,
};
use super::fingerprint::Fingerprint;
use super::models::{ConversionJob, ConversionStatus, StoredAsset, UploadSession, UploadStatus};
use super::progress::{ProgressTracker, SessionUpdate, TrackerError};
use super::store::{AssetStore, StageError, StorageError, StoreOutcome};
use crate::server::metrics;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that end an upload. Each maps to a stable code.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Upload session {0} is already in progress")]
    Conflict(String),

    #[error("Upload session {0} not found")]
    NotFound(String),

    #[error("Upload interrupted: {0}")]
    Interrupted(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl IngestionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::PayloadTooLarge { .. }) => "PAYLOAD_TOO_LARGE",
            Self::Validation(ValidationError::UnsupportedMediaType(_)) => "UNSUPPORTED_MEDIA_TYPE",
            Self::Validation(_) => "INVALID_REQUEST",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Conflict(_) => "SESSION_CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Interrupted(_) => "UPLOAD_INTERRUPTED",
            Self::Conversion(_) => "CONVERSION_ERROR",
        }
    }
}

impl From<TrackerError> for IngestionError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Conflict(id) => Self::Conflict(id),
            TrackerError::NotFound(id) => Self::NotFound(id),
        }
    }
}

impl From<StageError> for IngestionError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Read(e) => Self::Interrupted(e.to_string()),
            StageError::TooLarge { size, limit } => {
                Self::Validation(ValidationError::PayloadTooLarge { size, limit })
            }
            StageError::Storage(e) => Self::Storage(e),
        }
    }
}

/// A failed upload, with the session it was recorded under (if one was
/// created before the failure).
#[derive(Debug, Error)]
#[error("{error}")]
pub struct UploadRejected {
    pub session_id: Option<String>,
    #[source]
    pub error: IngestionError,
}

/// Upload metadata, everything except the body.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Client-supplied session id; one is generated when absent.
    pub session_id: Option<String>,
    pub filename: Option<String>,
    /// Content type of a raw body. `None` for multipart file parts, whose
    /// outer request type was already accepted.
    pub content_type: Option<String>,
    pub declared_size: Option<u64>,
}

/// Result of a completed storage phase.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub session_id: String,
    /// DONE or DUPLICATE.
    pub status: UploadStatus,
    pub duplicate: bool,
    pub asset: StoredAsset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionStatus>,
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub max_upload_bytes: u64,
    pub conversion_enabled: bool,
    pub target_extension: String,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: 4096 * 1024 * 1024,
            conversion_enabled: true,
            target_extension: "mp4".to_string(),
        }
    }
}

/// Marks its session FAILED if dropped while armed, which happens when the
/// request future is dropped mid-upload.
struct SessionGuard<'a> {
    tracker: &'a ProgressTracker,
    session_id: String,
    armed: bool,
}

impl SessionGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Upload {} dropped before completion", self.session_id);
            metrics::record_upload("failed");
            self.tracker.report(
                &self.session_id,
                SessionUpdate::failed("UPLOAD_INTERRUPTED", "Upload cancelled before completion"),
            );
        }
    }
}

pub struct IngestionCoordinator {
    store: Arc<AssetStore>,
    tracker: Arc<ProgressTracker>,
    conversions: Option<ConversionQueue>,
    settings: IngestionSettings,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<AssetStore>,
        tracker: Arc<ProgressTracker>,
        conversions: Option<ConversionQueue>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            store,
            tracker,
            conversions,
            settings,
        }
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    /// Snapshot of one session.
    pub fn progress(&self, session_id: &str) -> Result<UploadSession, IngestionError> {
        Ok(self.tracker.get(session_id)?)
    }

    pub fn asset(&self, fingerprint: &Fingerprint) -> Option<StoredAsset> {
        self.store.lookup(fingerprint)
    }

    /// Run one upload to the end of its storage phase.
    ///
    /// Returns once the asset is stored (or recognized as a duplicate);
    /// conversion, if any, continues in the background.
    pub async fn ingest<'a, S>(
        &self,
        request: UploadRequest,
        body: S,
    ) -> Result<UploadOutcome, UploadRejected>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        let mut body = body.boxed();

        // Rejected before any session exists: nothing was received yet
        let content_type = match &request.content_type {
            Some(ct) => match classify_content_type(Some(ct)) {
                Ok(BodyKind::Raw(essence)) => Some(essence),
                Ok(BodyKind::Multipart) | Err(_) => {
                    return Err(self.reject_unstarted(
                        &request,
                        ValidationError::UnsupportedMediaType(ct.clone()).into(),
                    ))
                }
            },
            None => None,
        };

        let filename = match &request.filename {
            Some(name) => name.clone(),
            None => {
                // Sniffing needs the first chunk; it is put back in front of the stream
                let content_type = content_type.as_deref().unwrap_or("application/octet-stream");
                let first = body.next().await;
                let sniffed = match &first {
                    Some(Ok(chunk)) => infer::get(chunk).map(|t| t.extension()),
                    _ => None,
                };
                let name = generate_filename(content_type, sniffed);
                body = stream::iter(first).chain(body).boxed();
                name
            }
        };

        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Err(e) = self
            .tracker
            .create(&session_id, &filename, request.declared_size)
        {
            warn!("Rejecting upload: {}", e);
            return Err(UploadRejected {
                session_id: None,
                error: e.into(),
            });
        }
        info!(
            "Upload {} started: {} ({})",
            session_id,
            filename,
            request
                .declared_size
                .map(format_size)
                .unwrap_or_else(|| "size unknown".to_string())
        );

        let guard = SessionGuard {
            tracker: &self.tracker,
            session_id: session_id.clone(),
            armed: true,
        };
        let result = self
            .run(&session_id, &filename, request.declared_size, body)
            .await;
        guard.disarm();

        match result {
            Ok(outcome) => {
                metrics::record_upload(if outcome.duplicate {
                    "duplicate"
                } else {
                    "stored"
                });
                metrics::set_stored_assets(self.store.len());
                Ok(outcome)
            }
            Err(e) => {
                match &e {
                    IngestionError::Storage(_) => error!("Upload {} failed: {}", session_id, e),
                    _ => warn!("Upload {} failed: {}", session_id, e),
                }
                metrics::record_upload("failed");
                self.tracker
                    .report(&session_id, SessionUpdate::failed(e.code(), e.to_string()));
                Err(UploadRejected {
                    session_id: Some(session_id),
                    error: e,
                })
            }
        }
    }

    async fn run(
        &self,
        session_id: &str,
        filename: &str,
        declared_size: Option<u64>,
        body: BoxStream<'_, io::Result<Bytes>>,
    ) -> Result<UploadOutcome, IngestionError> {
        let filename = sanitize_filename(filename)?;
        let limit = self.settings.max_upload_bytes;
        if let Some(size) = declared_size {
            if size > limit {
                return Err(ValidationError::PayloadTooLarge { size, limit }.into());
            }
        }

        // RECEIVING
        let tracker = &self.tracker;
        let staged = self
            .store
            .stage(body, Some(limit), |received| {
                tracker.report(session_id, SessionUpdate::bytes_received(received));
            })
            .await?;
        metrics::record_received_bytes(staged.size());

        // VALIDATING
        self.tracker.update(
            session_id,
            SessionUpdate::status(UploadStatus::Validating)
                .with_bytes_received(staged.size())
                .with_fingerprint(staged.fingerprint()),
        )?;
        if staged.size() == 0 {
            return Err(ValidationError::EmptyBody.into());
        }
        if let Some(declared) = declared_size {
            if declared != staged.size() {
                return Err(ValidationError::SizeMismatch {
                    declared,
                    received: staged.size(),
                }
                .into());
            }
        }

        if let Some(existing) = self.store.lookup(&staged.fingerprint()) {
            return self.finish_duplicate(session_id, existing);
        }

        // STORING
        self.tracker
            .update(session_id, SessionUpdate::status(UploadStatus::Storing))?;
        let asset = match self.store.commit(staged, &filename).await? {
            StoreOutcome::Duplicate(existing) => {
                return self.finish_duplicate(session_id, existing)
            }
            StoreOutcome::Stored(asset) => asset,
        };

        let conversion = self.schedule_conversion(session_id, &asset);
        let status = match conversion {
            Some(ConversionStatus::Pending) => UploadStatus::Converting,
            _ => UploadStatus::Done,
        };
        let mut update = SessionUpdate::status(status);
        if let Some(c) = conversion {
            update = update.with_conversion(c);
        }
        self.tracker.update(session_id, update)?;

        info!("Upload {} stored as {:?}", session_id, asset.path);
        Ok(UploadOutcome {
            session_id: session_id.to_string(),
            // The client sees DONE for the raw asset, conversion is polled
            status: UploadStatus::Done,
            duplicate: false,
            asset,
            conversion,
        })
    }

    fn finish_duplicate(
        &self,
        session_id: &str,
        existing: StoredAsset,
    ) -> Result<UploadOutcome, IngestionError> {
        self.tracker
            .update(session_id, SessionUpdate::status(UploadStatus::Duplicate))?;
        info!(
            "Upload {} is a duplicate of {:?}",
            session_id, existing.path
        );
        Ok(UploadOutcome {
            session_id: session_id.to_string(),
            status: UploadStatus::Duplicate,
            duplicate: true,
            asset: existing,
            conversion: None,
        })
    }

    /// Enqueue a conversion when the asset needs one. Conversion problems
    /// never fail the upload; they only show up in the conversion status.
    fn schedule_conversion(&self, session_id: &str, asset: &StoredAsset) -> Option<ConversionStatus> {
        if !asset.conversion_needed {
            return None;
        }
        let queue = match (&self.conversions, self.settings.conversion_enabled) {
            (Some(queue), true) => queue,
            _ => {
                debug!("Conversion disabled, keeping {:?} as is", asset.path);
                return None;
            }
        };

        let job = ConversionJob::new(session_id, asset, &self.settings.target_extension);
        match queue.submit(job) {
            Ok(()) => Some(ConversionStatus::Pending),
            Err(e) => {
                warn!("Could not schedule conversion for {:?}: {}", asset.path, e);
                metrics::record_conversion(e.kind(), std::time::Duration::ZERO);
                self.tracker
                    .report(session_id, SessionUpdate::conversion_failed(e.to_string()));
                Some(ConversionStatus::Failed)
            }
        }
    }

    /// Record a request rejected before streaming as its own FAILED session,
    /// so it is visible to pollers.
    fn reject_unstarted(&self, request: &UploadRequest, error: IngestionError) -> UploadRejected {
        warn!("Rejecting upload: {}", error);
        metrics::record_upload("failed");

        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let filename = request.filename.clone().unwrap_or_default();
        match self
            .tracker
            .create(&session_id, &filename, request.declared_size)
        {
            Ok(_) => {
                self.tracker.report(
                    &session_id,
                    SessionUpdate::failed(error.code(), error.to_string()),
                );
                UploadRejected {
                    session_id: Some(session_id),
                    error,
                }
            }
            Err(_) => UploadRejected {
                session_id: None,
                error,
            },
        }
    }
}

fn format_size(bytes: u64) -> String {
    format!(
        "{:.2}",
        byte_unit::Byte::from_u64(bytes).get_appropriate_unit(byte_unit::UnitType::Binary)
    )
}
