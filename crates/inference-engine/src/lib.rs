//! Model inference execution for Caption Studio
//!
//! This crate owns the single accelerator session: loading a variant's
//! weights, execution context and projector, tearing them down again, and
//! running streaming generation against them.

pub mod backend;
pub mod engine;
pub mod generation;
pub mod session;

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

use std::sync::Arc;

// Re-export commonly used types
pub use backend::{
    AcceleratorInfo, ExecutionContext, FragmentSource, Projector, SamplingParams, SessionOptions,
    UnavailableBackend, VisionBackend, Weights,
};
pub use engine::{EngineGuard, InferenceEngine};
pub use generation::{accumulate, FragmentStream, GenerationRequest};
pub use session::LoadedSession;

/// The backend this build ships with
pub fn default_backend() -> common::Result<Arc<dyn VisionBackend>> {
    #[cfg(feature = "llama")]
    {
        Ok(Arc::new(llama::LlamaCppBackend::new()?))
    }

    #[cfg(not(feature = "llama"))]
    {
        tracing::warn!("Built without an inference runtime; model loads will fail");
        Ok(Arc::new(UnavailableBackend))
    }
}
