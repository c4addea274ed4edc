//! Upload ingestion pipeline.
//!
//! 1. The client streams a photo or video to the receiver
//! 2. Bytes are staged in the scratch area and fingerprinted on the way
//! 3. Content already stored is reported as a duplicate, anything else is
//!    moved into the storage root under its original (or a disambiguated) name
//! 4. Proprietary video containers are transcoded in the background
//! 5. Every step is visible through the progress tracker

mod converter;
mod coordinator;
mod file_handler;
mod fingerprint;
mod maintenance;
mod models;
mod progress;
mod store;

pub use converter::{
    ConversionError, ConversionQueue, ConversionSettings, ConversionWorker, FfmpegTranscoder,
    Transcoder,
};
pub use coordinator::{
    IngestionCoordinator, IngestionError, IngestionSettings, UploadOutcome, UploadRejected,
    UploadRequest,
};
pub use file_handler::{
    classify_content_type, filename_from_content_disposition, sanitize_filename, BodyKind,
    ScratchArea, ValidationError,
};
pub use fingerprint::{
    fingerprint_file_blocking, fingerprint_reader, Fingerprint, FingerprintHasher,
    ParseFingerprintError, DEFAULT_CHUNK_SIZE,
};
pub use maintenance::{run_maintenance, spawn_maintenance, MaintenanceReport, MaintenanceSettings};
pub use models::{
    ConversionJob, ConversionStatus, MediaKind, StoredAsset, UploadSession, UploadStatus,
};
pub use progress::{ProgressTracker, SessionError, SessionUpdate, TrackerError};
pub use store::{AssetStore, StageError, StagedFile, StorageError, StoreOutcome};
