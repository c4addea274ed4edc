//! MediaDrop Server Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod config;
pub mod ingestion;
pub mod server;

// Re-export commonly used types for convenience
pub use ingestion::{AssetStore, IngestionCoordinator, ProgressTracker};
pub use server::{run_server, RequestsLoggingLevel, ServerConfig};
