//! Configuration manager
//!
//! Resolves the configuration file, applies environment overrides and
//! validates the result before any component reads it.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use common::error::{Error, Result};
use common::utils::parse_bool;

use crate::settings::{AppConfig, APP_DIR_NAME};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "CAPTION_STUDIO_CONFIG";

/// Environment variable overriding the models directory
pub const MODELS_DIR_ENV: &str = "CAPTION_STUDIO_MODELS_DIR";

/// Environment variable overriding the log level
pub const LOG_LEVEL_ENV: &str = "CAPTION_STUDIO_LOG";

/// Environment variable disabling accelerator offload
pub const FORCE_CPU_ENV: &str = "CAPTION_STUDIO_FORCE_CPU";

/// Configuration manager for Caption Studio
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Effective configuration
    config: AppConfig,

    /// File the configuration was read from, if any
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Loads configuration from `path`, the environment or the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(|| {
                dirs::config_dir()
                    .map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
                    .filter(|candidate| candidate.exists())
            });

        let mut config = match &path {
            Some(path) => Self::read_file(path)?,
            None => {
                debug!("No configuration file found, using defaults");
                AppConfig::default()
            }
        };

        Self::apply_overrides(&mut config, |key| std::env::var(key).ok());
        Self::validate(&config)?;

        if let Some(path) = &path {
            info!("Loaded configuration from {}", path.display());
        }

        Ok(Self {
            config,
            source: path,
        })
    }

    /// Wraps an already-built configuration
    pub fn from_config(config: AppConfig) -> Result<Self> {
        Self::validate(&config)?;
        Ok(Self {
            config,
            source: None,
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// File the configuration came from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Parses a TOML configuration file
    fn read_file(path: &Path) -> Result<AppConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        toml::from_str(&text)
            .map_err(|e| Error::Configuration(format!("invalid {}: {}", path.display(), e)))
    }

    /// Layers environment overrides on top of the file values
    fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(MODELS_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            config.models_dir = PathBuf::from(dir);
        }

        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|v| !v.trim().is_empty()) {
            config.logging.level = level;
        }

        if let Some(flag) = lookup(FORCE_CPU_ENV) {
            config.inference.force_cpu = parse_bool(&flag);
        }
    }

    /// Rejects values no component can work with
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.download.progress_interval_ms == 0 {
            return Err(Error::Configuration(
                "download.progress_interval_ms must be greater than zero".to_string(),
            ));
        }

        if config.inference.context_size == 0 || config.inference.batch_size == 0 {
            return Err(Error::Configuration(
                "inference.context_size and inference.batch_size must be greater than zero"
                    .to_string(),
            ));
        }

        if config.inference.max_tokens == 0 {
            return Err(Error::Configuration(
                "inference.max_tokens must be greater than zero".to_string(),
            ));
        }

        if config.caption.max_image_dimension == 0 {
            return Err(Error::Configuration(
                "caption.max_image_dimension must be greater than zero".to_string(),
            ));
        }

        let temperature = config.caption.default_temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::Configuration(format!(
                "caption.default_temperature must be within [0, 2], got {}",
                temperature
            )));
        }

        Ok(())
    }
}
