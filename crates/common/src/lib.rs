//! Common utilities and types for Caption Studio
//!
//! This crate provides shared functionality used across the captioning system,
//! including the error taxonomy, the shared data model and formatting helpers.

pub mod error;
pub mod models;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
