//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own storage root.

use super::constants::*;
use mediadrop_server::ingestion::{
    AssetStore, ConversionQueue, ConversionSettings, ConversionWorker, FfmpegTranscoder,
    IngestionCoordinator, IngestionSettings, ProgressTracker, ScratchArea, Transcoder,
    DEFAULT_CHUNK_SIZE,
};
use mediadrop_server::server::{make_app, RequestsLoggingLevel, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Knobs for a test server. The default has conversion disabled.
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub max_upload_bytes: u64,
    /// Transcoder binary. `None` disables conversion entirely.
    pub ffmpeg_path: Option<PathBuf>,
    pub session_retention: Duration,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            max_upload_bytes: 8 * 1024 * 1024,
            ffmpeg_path: None,
            session_retention: Duration::from_secs(3600),
        }
    }
}

/// Test server instance with an isolated storage root
///
/// When dropped, the server gracefully shuts down and temp resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Where stored assets land
    pub storage_dir: PathBuf,

    /// Direct access to the pipeline for assertions
    pub coordinator: Arc<IngestionCoordinator>,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    shutdown: CancellationToken,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port with default options
    pub async fn spawn() -> Self {
        Self::spawn_with(TestServerOptions::default()).await
    }

    /// Spawns a new test server on a random port
    ///
    /// This function:
    /// 1. Creates a temporary storage root
    /// 2. Opens the asset store and starts the conversion queue if asked to
    /// 3. Binds to a random port (127.0.0.1:0)
    /// 4. Spawns the server in a background task
    /// 5. Waits for the server to be ready
    ///
    /// # Panics
    ///
    /// Panics if:
    /// - The storage root cannot be created
    /// - Port binding fails
    /// - Server doesn't become ready within timeout
    pub async fn spawn_with(options: TestServerOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage_dir = temp_dir.path().join("media");

        let store = Arc::new(
            AssetStore::open(
                &storage_dir,
                ScratchArea::new(storage_dir.join(".incoming")),
                DEFAULT_CHUNK_SIZE,
            )
            .await
            .expect("Failed to open asset store"),
        );
        let tracker = Arc::new(ProgressTracker::new(options.session_retention));
        let shutdown = CancellationToken::new();

        let conversion_settings = ConversionSettings {
            enabled: options.ffmpeg_path.is_some(),
            ffmpeg_path: options
                .ffmpeg_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            max_concurrent: 1,
            ..Default::default()
        };
        let conversions = options.ffmpeg_path.as_ref().map(|_| {
            let transcoder: Arc<dyn Transcoder> =
                Arc::new(FfmpegTranscoder::new(&conversion_settings));
            ConversionQueue::start(
                ConversionWorker::new(transcoder, store.clone()),
                tracker.clone(),
                &conversion_settings,
                shutdown.child_token(),
            )
        });

        let coordinator = Arc::new(IngestionCoordinator::new(
            store,
            tracker,
            conversions,
            IngestionSettings {
                max_upload_bytes: options.max_upload_bytes,
                conversion_enabled: conversion_settings.enabled,
                target_extension: conversion_settings.target_extension.clone(),
            },
        ));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        // Build the app
        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            bind_address: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let app = make_app(config, coordinator.clone());

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        // Wait for server to be ready
        let server = Self {
            base_url,
            port,
            storage_dir,
            coordinator,
            _temp_dir: temp_dir,
            shutdown,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling the / endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    // Server is ready
                    return;
                }
                _ => {
                    // Server not ready yet, wait and retry
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    /// Names of the files directly under the storage root, sorted
    #[allow(dead_code)]
    pub fn stored_file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.storage_dir)
            .expect("Failed to read storage dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Stop background conversions, then the HTTP server
        self.shutdown.cancel();
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
        // TempDir will be cleaned up automatically
    }
}
