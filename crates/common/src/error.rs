//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every captioning component.

use thiserror::Error;

/// Result type for Caption Studio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Caption Studio operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unknown variant or invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Model artifacts are missing or corrupt
    #[error("Model not present: {0}")]
    NotPresent(String),

    /// Network or IO failure while transferring artifacts
    #[error("Download error: {0}")]
    Download(String),

    /// A transfer for the same variant is already running
    #[error("Download already in progress: {0}")]
    DownloadInProgress(String),

    /// Session construction failure
    #[error("Load error: {0}")]
    Load(String),

    /// Malformed job or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad or unsupported image
    #[error("Preprocessing error: {0}")]
    Preprocessing(String),

    /// Unexpected failure during inference
    #[error("Generation error: {0}")]
    Generation(String),

    /// Cooperative cancellation; always propagated
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if the error is a cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if the error belongs to the download family
    pub fn is_download(&self) -> bool {
        matches!(self, Error::Download(_) | Error::DownloadInProgress(_))
    }

    /// Returns true if the error reports missing or corrupt artifacts
    pub fn is_not_present(&self) -> bool {
        matches!(self, Error::NotPresent(_))
    }

    /// Returns true if the error is a configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}
