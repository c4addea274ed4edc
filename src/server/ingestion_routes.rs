//! Ingestion HTTP routes.
//!
//! Provides endpoints for:
//! - Uploading a photo or video (multipart or raw body)
//! - Polling the progress of an upload session
//! - Listing tracked sessions for the dashboard
//! - Looking up a stored asset by fingerprint
//! - Static setup instructions

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::{debug, warn};

use crate::ingestion::{
    classify_content_type, filename_from_content_disposition, BodyKind, ConversionStatus,
    Fingerprint, IngestionError, MediaKind, StoredAsset, UploadOutcome, UploadRejected,
    UploadRequest, UploadSession, UploadStatus, ValidationError,
};
use crate::server::state::{GuardedCoordinator, ServerState};

/// Client-chosen session id header.
pub const UPLOAD_ID_HEADER: &str = "x-upload-id";
/// Client-declared body size header.
pub const UPLOAD_SIZE_HEADER: &str = "x-upload-size";

const SETUP_INSTRUCTIONS: &str = "\
MediaDrop receiver setup
========================

1. Make sure the phone and this computer are on the same network.
2. Note this computer's LAN address and the receiver port (5001 by default).
3. On the phone, create a shortcut or automation that sends each photo or
   video with an HTTP POST to:

       http://<computer-address>:5001/upload

   Either as multipart/form-data with the file in a field named \"file\",
   or as the raw file body with its image/* or video/* content type.
4. Optional headers:
       Content-Disposition: attachment; filename=\"IMG_0001.HEIC\"
       X-Upload-Id: <your own id, to poll progress>
       X-Upload-Size: <size in bytes>
5. Poll http://<computer-address>:5001/upload/<id> to follow an upload.

Files that were already received are detected by content and not stored
twice. QuickTime videos (.mov) are additionally converted to .mp4.
";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub session_id: Option<String>,
    pub filename: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub fingerprint: Fingerprint,
    /// File name under the storage root.
    pub filename: String,
    pub original_filename: String,
    pub size: u64,
    pub media_kind: MediaKind,
    pub conversion_needed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_filename: Option<String>,
}

impl From<&StoredAsset> for AssetResponse {
    fn from(asset: &StoredAsset) -> Self {
        Self {
            fingerprint: asset.fingerprint,
            filename: asset.file_name().to_string(),
            original_filename: asset.original_filename.clone(),
            size: asset.size,
            media_kind: asset.media_kind,
            conversion_needed: asset.conversion_needed,
            converted_filename: asset
                .converted_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub session_id: String,
    pub status: UploadStatus,
    pub duplicate: bool,
    pub asset: AssetResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionStatus>,
}

impl From<UploadOutcome> for UploadResponse {
    fn from(outcome: UploadOutcome) -> Self {
        Self {
            asset: AssetResponse::from(&outcome.asset),
            session_id: outcome.session_id,
            status: outcome.status,
            duplicate: outcome.duplicate,
            conversion: outcome.conversion,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<UploadSession>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

// =============================================================================
// Error mapping
// =============================================================================

fn status_for(error: &IngestionError) -> StatusCode {
    match error.code() {
        "PAYLOAD_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
        "UNSUPPORTED_MEDIA_TYPE" => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "INVALID_REQUEST" | "UPLOAD_INTERRUPTED" => StatusCode::BAD_REQUEST,
        "SESSION_CONFLICT" => StatusCode::CONFLICT,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &IngestionError, session_id: Option<String>) -> Response {
    (
        status_for(error),
        Json(ErrorResponse {
            code: error.code().to_string(),
            error: error.to_string(),
            session_id,
        }),
    )
        .into_response()
}

impl IntoResponse for UploadRejected {
    fn into_response(self) -> Response {
        error_response(&self.error, self.session_id)
    }
}

// =============================================================================
// Header helpers
// =============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn to_io_error<E>(err: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::Other, err)
}

// =============================================================================
// Routes
// =============================================================================

/// POST /upload - Receive a photo or video
async fn upload(
    State(coordinator): State<GuardedCoordinator>,
    Query(query): Query<UploadQuery>,
    request: Request<Body>,
) -> Response {
    let headers = request.headers().clone();
    let session_id = header_str(&headers, UPLOAD_ID_HEADER)
        .map(str::to_string)
        .or(query.session_id);
    let declared_size = header_u64(&headers, UPLOAD_SIZE_HEADER).or(query.size);
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string);

    let is_multipart = matches!(
        classify_content_type(content_type.as_deref()),
        Ok(BodyKind::Multipart)
    );

    let result = if is_multipart {
        let mut multipart = match Multipart::from_request(request, &()).await {
            Ok(m) => m,
            Err(e) => {
                let error = IngestionError::from(ValidationError::MissingFile(e.body_text()));
                return error_response(&error, None);
            }
        };

        let mut seen_fields = Vec::new();
        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => {
                    let error = IngestionError::from(ValidationError::MissingFile(format!(
                        "No 'file' field found. Available fields: {:?}",
                        seen_fields
                    )));
                    return error_response(&error, None);
                }
                Err(e) => {
                    warn!("Malformed multipart upload: {}", e);
                    let error = IngestionError::from(ValidationError::MissingFile(e.body_text()));
                    return error_response(&error, None);
                }
            };

            let name = field.name().unwrap_or_default().to_string();
            if name != "file" {
                seen_fields.push(name);
                continue;
            }

            let filename = field
                .file_name()
                .map(str::to_string)
                .filter(|f| !f.is_empty())
                .or(query.filename.clone());
            let Some(filename) = filename else {
                let error =
                    IngestionError::from(ValidationError::MissingFile("No file selected".into()));
                return error_response(&error, None);
            };

            let request = UploadRequest {
                session_id,
                filename: Some(filename),
                content_type: None,
                declared_size,
            };
            break coordinator
                .ingest(request, field.map_err(to_io_error))
                .await;
        }
    } else {
        let filename = header_str(&headers, header::CONTENT_DISPOSITION.as_str())
            .and_then(filename_from_content_disposition)
            .or(query.filename);
        let declared_size =
            declared_size.or_else(|| header_u64(&headers, header::CONTENT_LENGTH.as_str()));
        let request_meta = UploadRequest {
            session_id,
            filename,
            content_type: Some(
                content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            ),
            declared_size,
        };
        let body = request.into_body().into_data_stream().map_err(to_io_error);
        coordinator.ingest(request_meta, body).await
    };

    match result {
        Ok(outcome) => {
            debug!("Upload {} finished as {:?}", outcome.session_id, outcome.status);
            Json(UploadResponse::from(outcome)).into_response()
        }
        Err(rejected) => rejected.into_response(),
    }
}

/// GET /upload/{session_id} - Poll an upload session
async fn get_upload(
    State(coordinator): State<GuardedCoordinator>,
    Path(session_id): Path<String>,
) -> Response {
    match coordinator.progress(&session_id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(&e, Some(session_id)),
    }
}

/// GET /uploads - All tracked sessions, newest first
async fn list_uploads(State(coordinator): State<GuardedCoordinator>) -> impl IntoResponse {
    Json(SessionsResponse {
        sessions: coordinator.tracker().list(),
    })
}

/// GET /asset/{fingerprint} - Look up a stored asset
async fn get_asset(
    State(coordinator): State<GuardedCoordinator>,
    Path(fingerprint): Path<String>,
) -> Response {
    let fingerprint: Fingerprint = match fingerprint.parse() {
        Ok(fp) => fp,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    code: "INVALID_REQUEST".to_string(),
                    error: e.to_string(),
                    session_id: None,
                }),
            )
                .into_response()
        }
    };

    match coordinator.asset(&fingerprint) {
        Some(asset) => Json(AssetResponse::from(&asset)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                code: "NOT_FOUND".to_string(),
                error: format!("No asset with fingerprint {}", fingerprint),
                session_id: None,
            }),
        )
            .into_response(),
    }
}

/// GET /setup - Plain-text setup instructions
async fn setup() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        SETUP_INSTRUCTIONS,
    )
}

/// Creates the ingestion routes.
///
/// - POST /upload - Upload a file (no framework body limit, the coordinator
///   enforces the configured maximum while streaming)
/// - GET /upload/{session_id} - Session progress
/// - GET /uploads - All sessions
/// - GET /asset/{fingerprint} - Stored asset
/// - GET /setup - Setup instructions
pub fn ingestion_routes() -> Router<ServerState> {
    let upload_route = Router::new()
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .merge(upload_route)
        .route("/upload/{session_id}", get(get_upload))
        .route("/uploads", get(list_uploads))
        .route("/asset/{fingerprint}", get(get_asset))
        .route("/setup", get(setup))
}
