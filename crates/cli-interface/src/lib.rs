//! Command-line interface for Caption Studio
//!
//! Argument parsing, progress bars and report formatting for the
//! `caption-studio` binary.

pub mod cli;
pub mod formatters;
pub mod progress;

// Re-export commonly used types
pub use cli::{CaptionArgs, Cli, Command};
pub use formatters::{format_outcome, format_summary, format_variant_table};
pub use progress::{BatchBar, DownloadBar};
