//! Logging for Caption Studio
//!
//! This crate installs the global `tracing` subscriber: an env-driven filter,
//! a console layer (plain or JSON) and an optional daily-rolling file layer.

pub mod logger;

// Re-export commonly used types
pub use logger::{build_filter, init, LoggingGuard};
