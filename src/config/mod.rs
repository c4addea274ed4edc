mod file_config;

pub use file_config::{ConversionConfig, FileConfig, SessionsConfig};

use crate::ingestion::{ConversionSettings, IngestionSettings, MaintenanceSettings};
use crate::server::{RequestsLoggingLevel, ServerConfig};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Name of the scratch directory created under the storage root when no
/// explicit scratch directory is configured.
pub const DEFAULT_SCRATCH_DIR_NAME: &str = ".incoming";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub storage_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub bind_address: String,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub max_upload_mb: u64,
    pub ffmpeg_path: PathBuf,
    pub frontend_dir_path: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            scratch_dir: None,
            bind_address: "0.0.0.0".to_string(),
            port: 5001,
            metrics_port: 9091,
            logging_level: RequestsLoggingLevel::Path,
            max_upload_mb: 4096,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            frontend_dir_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub storage_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub bind_address: String,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,

    // Feature settings (with defaults)
    pub ingestion: IngestionSettings,
    pub conversion: ConversionSettings,
    pub sessions: SessionsSettings,
}

#[derive(Debug, Clone)]
pub struct SessionsSettings {
    /// How long a settled session stays visible to pollers.
    pub retention: Duration,
    pub maintenance: MaintenanceSettings,
}

impl Default for SessionsSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            maintenance: MaintenanceSettings::default(),
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let storage_dir = file
            .storage_dir
            .map(PathBuf::from)
            .or_else(|| cli.storage_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("storage_dir must be specified via --storage-dir or in config file")
            })?;

        // A missing storage dir is created on startup, a file in its place is not usable
        if storage_dir.exists() && !storage_dir.is_dir() {
            bail!("storage_dir is not a directory: {:?}", storage_dir);
        }

        let scratch_dir = file
            .scratch_dir
            .map(PathBuf::from)
            .or_else(|| cli.scratch_dir.clone())
            .unwrap_or_else(|| storage_dir.join(DEFAULT_SCRATCH_DIR_NAME));
        if scratch_dir.exists() && !scratch_dir.is_dir() {
            bail!("scratch_dir is not a directory: {:?}", scratch_dir);
        }
        // Staged uploads are moved into place with a rename, which cannot
        // cross filesystems
        let within_storage = absolute(&scratch_dir)?
            .strip_prefix(absolute(&storage_dir)?)
            .map(|rest| {
                rest.components().next().is_some()
                    && rest.components().all(|c| matches!(c, Component::Normal(_)))
            })
            .unwrap_or(false);
        if !within_storage {
            bail!(
                "scratch_dir must be a directory inside storage_dir ({:?} is not inside {:?})",
                scratch_dir,
                storage_dir
            );
        }

        let bind_address = file
            .bind_address
            .unwrap_or_else(|| cli.bind_address.clone());
        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        if port == metrics_port && port != 0 {
            bail!("port and metrics_port must differ (both {})", port);
        }

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let frontend_dir_path = file
            .frontend_dir_path
            .or_else(|| cli.frontend_dir_path.clone());

        let max_upload_mb = file.max_upload_mb.unwrap_or(cli.max_upload_mb);
        if max_upload_mb == 0 {
            bail!("max_upload_mb must be greater than 0");
        }

        // Conversion settings - merge file config with defaults
        let conv_file = file.conversion.unwrap_or_default();
        let conv_defaults = ConversionSettings::default();
        let conversion = ConversionSettings {
            enabled: conv_file.enabled.unwrap_or(conv_defaults.enabled)
                && !cfg!(feature = "no_conversion"),
            ffmpeg_path: conv_file
                .ffmpeg_path
                .or(file.ffmpeg_path)
                .map(PathBuf::from)
                .unwrap_or_else(|| cli.ffmpeg_path.clone()),
            video_codec: conv_file.video_codec.unwrap_or(conv_defaults.video_codec),
            audio_codec: conv_file.audio_codec.unwrap_or(conv_defaults.audio_codec),
            target_extension: conv_file
                .target_extension
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .unwrap_or(conv_defaults.target_extension),
            max_concurrent: conv_file
                .max_concurrent
                .unwrap_or(conv_defaults.max_concurrent)
                .max(1),
            queue_size: conv_file
                .queue_size
                .unwrap_or(conv_defaults.queue_size)
                .max(1),
        };

        let max_upload_bytes = max_upload_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            anyhow::anyhow!("max_upload_mb is too large: {}", max_upload_mb)
        })?;

        let ingestion = IngestionSettings {
            max_upload_bytes,
            conversion_enabled: conversion.enabled,
            target_extension: conversion.target_extension.clone(),
        };

        let sessions_file = file.sessions.unwrap_or_default();
        let session_defaults = SessionsSettings::default();
        let sessions = SessionsSettings {
            retention: sessions_file
                .retention_secs
                .map(Duration::from_secs)
                .unwrap_or(session_defaults.retention),
            maintenance: MaintenanceSettings {
                prune_interval: sessions_file
                    .prune_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(session_defaults.maintenance.prune_interval),
                orphan_grace: sessions_file
                    .orphan_grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(session_defaults.maintenance.orphan_grace),
            },
        };

        Ok(Self {
            storage_dir,
            scratch_dir,
            bind_address,
            port,
            metrics_port,
            logging_level,
            frontend_dir_path,
            ingestion,
            conversion,
            sessions,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            requests_logging_level: self.logging_level.clone(),
            bind_address: self.bind_address.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            frontend_dir_path: self.frontend_dir_path.clone(),
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
