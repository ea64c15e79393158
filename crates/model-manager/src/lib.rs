//! Model lifecycle management for Caption Studio
//!
//! This crate knows which vision-language model variants exist, whether their
//! artifacts are on disk, and how to download and delete them.

pub mod catalog;
pub mod downloader;
pub mod lifecycle;
pub mod source;

// Re-export commonly used types
pub use catalog::{ArtifactSpec, ModelCatalog, ModelVariant, PromptFamily};
pub use downloader::ProgressCallback;
pub use lifecycle::{ModelLifecycleManager, ResolvedArtifacts, MIN_COMPLETE_RATIO};
pub use source::{ArtifactResponse, ArtifactSource, ByteStream, HttpArtifactSource};
