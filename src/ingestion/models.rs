//! Data models for the ingestion pipeline.
//!
//! Upload lifecycle:
//! 1. RECEIVING: body is streamed into the scratch area while being hashed
//! 2. VALIDATING: digest finalized, size checked against the declaration
//! 3. DUPLICATE (content already stored) or STORING (placed under the root)
//! 4. DONE, or CONVERTING while a proprietary video is transcoded
//! 5. FAILED from any state on an unrecoverable error

use super::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Status of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Receiving,
    Validating,
    Storing,
    Converting,
    Done,
    Failed,
    Duplicate,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receiving => "RECEIVING",
            Self::Validating => "VALIDATING",
            Self::Storing => "STORING",
            Self::Converting => "CONVERTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Duplicate => "DUPLICATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECEIVING" => Some(Self::Receiving),
            "VALIDATING" => Some(Self::Validating),
            "STORING" => Some(Self::Storing),
            "CONVERTING" => Some(Self::Converting),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            "DUPLICATE" => Some(Self::Duplicate),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Duplicate)
    }
}

/// Status of a conversion job, also reported as the session's conversion sub-status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Photo and video extensions recognized by the receiver.
const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "heic", "heif", "webp", "tif", "tiff", "bmp", "dng",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "webm", "mkv", "avi", "3gp"];
const PROPRIETARY_VIDEO_EXTENSIONS: &[&str] = &["mov", "qt"];

/// Media kind of a stored asset, decided once from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Photo,
    Video,
    /// QuickTime container, transcoded to a broadly playable format.
    ProprietaryVideo,
    Unknown,
}

impl MediaKind {
    pub fn from_filename(filename: &str) -> Self {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some(e) if PHOTO_EXTENSIONS.contains(&e) => Self::Photo,
            Some(e) if VIDEO_EXTENSIONS.contains(&e) => Self::Video,
            Some(e) if PROPRIETARY_VIDEO_EXTENSIONS.contains(&e) => Self::ProprietaryVideo,
            _ => Self::Unknown,
        }
    }

    pub fn needs_conversion(&self) -> bool {
        matches!(self, Self::ProprietaryVideo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "PHOTO",
            Self::Video => "VIDEO",
            Self::ProprietaryVideo => "PROPRIETARY_VIDEO",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Tracked state of one client upload attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub filename: String,
    /// Size declared by the client, if any.
    pub declared_size: Option<u64>,
    pub status: UploadStatus,
    pub bytes_received: u64,
    /// Creation time, milliseconds since epoch.
    pub created_at: i64,
    /// Last mutation time, milliseconds since epoch.
    pub updated_at: i64,
    /// Human-readable cause when the upload failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error code matching `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Conversion sub-status, only present for assets that need conversion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_error: Option<String>,
}

impl UploadSession {
    pub fn new(id: &str, filename: &str, declared_size: Option<u64>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.to_string(),
            filename: filename.to_string(),
            declared_size,
            status: UploadStatus::Receiving,
            bytes_received: 0,
            created_at: now,
            updated_at: now,
            error: None,
            error_code: None,
            fingerprint: None,
            conversion: None,
            conversion_error: None,
        }
    }

    /// Terminal when the upload settled and no conversion is outstanding.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal() && self.conversion.map_or(true, |c| c.is_terminal())
    }
}

/// A file persisted under the storage root, unique per fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub fingerprint: Fingerprint,
    /// Absolute path of the stored original.
    pub path: PathBuf,
    /// Filename as declared by the client (after sanitisation).
    pub original_filename: String,
    pub size: u64,
    pub media_kind: MediaKind,
    pub conversion_needed: bool,
    /// Transcoded copy, once a conversion succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_path: Option<PathBuf>,
}

impl StoredAsset {
    pub fn new(fingerprint: Fingerprint, path: PathBuf, original_filename: &str, size: u64) -> Self {
        let media_kind = MediaKind::from_filename(original_filename);
        Self {
            fingerprint,
            path,
            original_filename: original_filename.to_string(),
            size,
            media_kind,
            conversion_needed: media_kind.needs_conversion(),
            converted_path: None,
        }
    }

    /// Final file name under the root.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// A queued request to transcode a stored proprietary video.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: String,
    /// Session to report progress to.
    pub session_id: String,
    pub fingerprint: Fingerprint,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub status: ConversionStatus,
}

impl ConversionJob {
    pub fn new(session_id: &str, asset: &StoredAsset, target_extension: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            fingerprint: asset.fingerprint,
            source_path: asset.path.clone(),
            target_path: asset.path.with_extension(target_extension),
            status: ConversionStatus::Pending,
        }
    }
}
