//! File handling for uploads: request metadata validation, filename
//! sanitisation and the scratch area holding in-progress temp files.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Client-fixable problems with an upload request.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Upload too large: {size} bytes (max: {limit})")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("No data received")]
    EmptyBody,

    #[error("Size mismatch: declared {declared} bytes, received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("Missing file: {0}")]
    MissingFile(String),
}

/// Content types accepted as a raw upload body.
const RAW_CONTENT_TYPE_PREFIXES: &[&str] = &["image/", "video/"];
const OCTET_STREAM: &str = "application/octet-stream";
const MULTIPART: &str = "multipart/form-data";

/// How the request body has to be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyKind {
    /// `multipart/form-data` with a `file` field.
    Multipart,
    /// Raw bytes with the given (parameter-free, lowercase) content type.
    Raw(String),
}

/// Classify a request content type, rejecting anything that isn't a media upload.
///
/// A missing content type is treated as `application/octet-stream`.
pub fn classify_content_type(content_type: Option<&str>) -> Result<BodyKind, ValidationError> {
    let Some(raw) = content_type else {
        return Ok(BodyKind::Raw(OCTET_STREAM.to_string()));
    };
    let essence = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    if essence == MULTIPART {
        return Ok(BodyKind::Multipart);
    }
    if essence == OCTET_STREAM
        || RAW_CONTENT_TYPE_PREFIXES
            .iter()
            .any(|p| essence.starts_with(p) && essence.len() > p.len())
    {
        return Ok(BodyKind::Raw(essence));
    }
    Err(ValidationError::UnsupportedMediaType(raw.to_string()))
}

/// Extract `filename="..."` from a Content-Disposition header value.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let (key, val) = part.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("filename") {
            let name = val.trim().trim_matches(|c| c == '"' || c == '\'');
            (!name.is_empty()).then(|| name.to_string())
        } else {
            None
        }
    })
}

/// Generate a filename for a raw upload that didn't carry one.
///
/// Images become `image_<timestamp>.<ext>`, everything else
/// `file_<timestamp>.<ext>`. The extension sniffed from the payload wins
/// over the declared content type; `ext` falls back to `bin`.
pub fn generate_filename(content_type: &str, sniffed_extension: Option<&str>) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    let ext = sniffed_extension
        .filter(|ext| !ext.is_empty())
        .or_else(|| extension_for_content_type(content_type))
        .unwrap_or("bin");

    if content_type.starts_with("image/") {
        format!("image_{}.{}", timestamp, ext)
    } else {
        format!("file_{}.{}", timestamp, ext)
    }
}

/// File extension for a declared media type.
///
/// Types whose subtype is not a usable extension are mapped explicitly so the
/// generated name classifies the same way a phone-supplied name would.
fn extension_for_content_type(content_type: &str) -> Option<&str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    let (_, subtype) = essence.split_once('/')?;
    let mapped = match essence.to_ascii_lowercase().as_str() {
        "video/quicktime" => Some("mov"),
        "video/x-matroska" => Some("mkv"),
        "video/x-msvideo" => Some("avi"),
        "video/x-m4v" => Some("m4v"),
        "video/3gpp" => Some("3gp"),
        "image/jpeg" | "image/pjpeg" => Some("jpg"),
        "image/svg+xml" => Some("svg"),
        "image/x-adobe-dng" => Some("dng"),
        "image/x-ms-bmp" => Some("bmp"),
        _ => None,
    };
    mapped.or_else(|| {
        let subtype = subtype.trim();
        let usable = !subtype.is_empty() && subtype.chars().all(|c| c.is_ascii_alphanumeric());
        usable.then_some(subtype)
    })
}

/// Sanitize a filename to prevent path traversal attacks.
pub fn sanitize_filename(filename: &str) -> Result<String, ValidationError> {
    // Clients may send Windows-style paths; keep only the last component
    let last = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let name = Path::new(last)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ValidationError::InvalidFilename(filename.to_string()))?;

    // Null bytes, hidden files and bare ".." are never allowed
    if name.contains('\0') || name.starts_with('.') || name == ".." {
        return Err(ValidationError::InvalidFilename(filename.to_string()));
    }

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();

    if sanitized.trim().is_empty() {
        return Err(ValidationError::InvalidFilename(filename.to_string()));
    }

    Ok(sanitized)
}

/// Scratch area for in-progress uploads and conversions.
///
/// Everything in here is disposable: files are moved out on success and
/// removed on failure, and leftovers from a crash are swept.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    dir: PathBuf,
}

impl ScratchArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the scratch directory.
    pub async fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Remove every entry. Run at startup, before any upload is accepted.
    pub async fn sweep_all(&self) -> std::io::Result<usize> {
        self.sweep(Duration::ZERO).await
    }

    /// Remove entries whose last modification is older than `min_age`.
    pub async fn sweep(&self, min_age: Duration) -> std::io::Result<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Already gone (finished upload raced with the sweep)
                Err(_) => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age < min_age {
                continue;
            }

            let result = if metadata.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    debug!("Removed orphaned scratch entry {:?}", path);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove scratch entry {:?}: {}", path, e),
            }
        }

        Ok(removed)
    }

    /// Count entries; used by tests and the status endpoint.
    pub async fn entry_count(&self) -> std::io::Result<usize> {
        let mut count = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}
