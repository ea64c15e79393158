//! Configuration sections and their defaults

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application name used for data and config directories
pub const APP_DIR_NAME: &str = "caption-studio";

/// Default instruction used when a job does not supply one
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Describe this image in one detailed sentence suitable as a training caption. \
     Mention the subject, setting, lighting and style. Do not speculate.";

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding model artifacts
    pub models_dir: PathBuf,

    /// Artifact transfer settings
    pub download: DownloadConfig,

    /// Session and generation settings
    pub inference: InferenceConfig,

    /// Caption pipeline settings
    pub caption: CaptionConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            download: DownloadConfig::default(),
            inference: InferenceConfig::default(),
            caption: CaptionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Artifact transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Minimum delay between two progress emissions
    pub progress_interval_ms: u64,

    /// User agent sent with every request
    pub user_agent: String,

    /// TCP connect timeout
    pub connect_timeout_secs: u64,

    /// Free space that must remain on the models volume after a transfer
    pub min_free_space_margin_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 250,
            user_agent: format!("{}/{}", APP_DIR_NAME, env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            min_free_space_margin_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Session and generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Execution context size in tokens
    pub context_size: u32,

    /// Prompt evaluation batch size
    pub batch_size: u32,

    /// Token budget per caption
    pub max_tokens: usize,

    /// Layers to offload when an accelerator is available
    pub gpu_layers: u32,

    /// Never offload, even when an accelerator is present
    pub force_cpu: bool,

    /// Host threads, 0 for automatic
    pub threads: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            batch_size: 512,
            max_tokens: 300,
            gpu_layers: 999,
            force_cpu: false,
            threads: 0,
        }
    }
}

/// Caption pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    /// Longest image edge handed to the model
    pub max_image_dimension: u32,

    /// Sampling temperature used when a job does not override it
    pub default_temperature: f32,

    /// Instruction used when a job does not supply one
    pub default_system_prompt: String,

    /// Write captions here instead of beside the images
    pub output_dir: Option<PathBuf>,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            max_image_dimension: 1024,
            default_temperature: 0.7,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            output_dir: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Also write logs to this file (rotated daily)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("models")
}
