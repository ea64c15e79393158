//! Caption orchestration for Caption Studio
//!
//! This crate turns caption jobs into ordered per-image outcomes: it prepares
//! images, drives the inference engine, cleans up generated text and writes
//! caption files.

pub mod job;
pub mod orchestrator;
pub mod postprocess;
pub mod preprocess;

// Re-export commonly used types
pub use job::{CaptionDestination, CaptionJob, CaptionSettings, CAPTION_EXTENSION};
pub use orchestrator::{BatchProgressCallback, CaptionOrchestrator};
pub use postprocess::CaptionCleaner;
pub use preprocess::{ImagePreprocessor, ImageSource, PreparedImage, StandardPreprocessor};
