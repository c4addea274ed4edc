use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub storage_dir: Option<String>,
    pub scratch_dir: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,
    pub max_upload_mb: Option<u64>,
    pub ffmpeg_path: Option<String>,
    pub frontend_dir_path: Option<String>,

    // Feature configs
    pub conversion: Option<ConversionConfig>,
    pub sessions: Option<SessionsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ConversionConfig {
    pub enabled: Option<bool>,
    pub ffmpeg_path: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Extension of converted files, without the dot.
    pub target_extension: Option<String>,
    pub max_concurrent: Option<usize>,
    pub queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SessionsConfig {
    pub retention_secs: Option<u64>,
    pub prune_interval_secs: Option<u64>,
    pub orphan_grace_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
