use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mediadrop_server::config;
use mediadrop_server::ingestion::{
    spawn_maintenance, AssetStore, ConversionQueue, ConversionWorker, FfmpegTranscoder,
    IngestionCoordinator, ProgressTracker, ScratchArea, Transcoder, DEFAULT_CHUNK_SIZE,
};
use mediadrop_server::server::{metrics, run_server, RequestsLoggingLevel};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory receiving the stored photos and videos.
    #[clap(long, value_parser = parse_path)]
    pub storage_dir: Option<PathBuf>,

    /// Directory for in-progress uploads, inside the storage dir. Defaults to <storage-dir>/.incoming
    #[clap(long, value_parser = parse_path)]
    pub scratch_dir: Option<PathBuf>,

    /// The address to listen on.
    #[clap(long, default_value = "0.0.0.0")]
    pub bind_address: String,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 5001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Maximum accepted upload size in MiB.
    #[clap(long, default_value_t = 4096)]
    pub max_upload_mb: u64,

    /// ffmpeg binary used to convert QuickTime videos.
    #[clap(long, default_value = "ffmpeg")]
    pub ffmpeg_path: PathBuf,

    /// Path to the frontend directory to be statically served.
    #[clap(long)]
    pub frontend_dir_path: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            storage_dir: args.storage_dir.clone(),
            scratch_dir: args.scratch_dir.clone(),
            bind_address: args.bind_address.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level.clone(),
            max_upload_mb: args.max_upload_mb,
            ffmpeg_path: args.ffmpeg_path.clone(),
            frontend_dir_path: args.frontend_dir_path.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  storage_dir: {:?}", app_config.storage_dir);
    info!("  scratch_dir: {:?}", app_config.scratch_dir);
    info!(
        "  max upload: {} MiB",
        app_config.ingestion.max_upload_bytes / (1024 * 1024)
    );
    info!(
        "  conversion: {} ({:?})",
        if app_config.conversion.enabled {
            "enabled"
        } else {
            "disabled"
        },
        app_config.conversion.ffmpeg_path
    );

    // Initialize metrics system
    info!("Initializing metrics...");
    metrics::init_metrics();

    let store = Arc::new(
        AssetStore::open(
            &app_config.storage_dir,
            ScratchArea::new(&app_config.scratch_dir),
            DEFAULT_CHUNK_SIZE,
        )
        .await
        .with_context(|| format!("Failed to open storage at {:?}", app_config.storage_dir))?,
    );
    metrics::set_stored_assets(store.len());

    let tracker = Arc::new(ProgressTracker::new(app_config.sessions.retention));
    let shutdown_token = CancellationToken::new();

    let conversions = if app_config.conversion.enabled {
        let transcoder = FfmpegTranscoder::new(&app_config.conversion);
        if !transcoder.is_available().await {
            warn!(
                "ffmpeg not found at {:?}, QuickTime videos will be stored but not converted",
                app_config.conversion.ffmpeg_path
            );
        }
        let transcoder: Arc<dyn Transcoder> = Arc::new(transcoder);
        Some(ConversionQueue::start(
            ConversionWorker::new(transcoder, store.clone()),
            tracker.clone(),
            &app_config.conversion,
            shutdown_token.child_token(),
        ))
    } else {
        None
    };

    let maintenance_handle = spawn_maintenance(
        tracker.clone(),
        store.clone(),
        app_config.sessions.maintenance.clone(),
        shutdown_token.child_token(),
    );

    let coordinator = Arc::new(IngestionCoordinator::new(
        store,
        tracker,
        conversions,
        app_config.ingestion.clone(),
    ));

    info!(
        "Ready to receive uploads at {}:{}!",
        app_config.bind_address, app_config.port
    );
    info!("Metrics available at port {}!", app_config.metrics_port);

    let server = run_server(
        app_config.server_config(),
        coordinator,
        shutdown_token.clone(),
    );
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => {
            info!("HTTP server stopped: {:?}", result);
            shutdown_token.cancel();
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            server.await
        }
    };

    let _ = maintenance_handle.await;
    result
}
