//! Configuration management for Caption Studio
//!
//! This crate provides the typed application configuration, loaded from a TOML
//! file with environment overrides layered on top of built-in defaults.

pub mod manager;
pub mod settings;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use settings::{AppConfig, CaptionConfig, DownloadConfig, InferenceConfig, LoggingConfig};
