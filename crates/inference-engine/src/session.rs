//! Accelerator sessions
//!
//! A [`LoadedSession`] owns the weights, execution context and projector of
//! one variant. Handles are released projector first, then context, then
//! weights, whether the session was fully built or not.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::Result;
use model_manager::{ModelVariant, ResolvedArtifacts};

use crate::backend::{ExecutionContext, Projector, SessionOptions, VisionBackend, Weights};
use crate::generation::{accumulate, FragmentStream, GenerationRequest};

/// One fully constructed session
pub struct LoadedSession {
    variant: ModelVariant,
    image_marker: &'static str,

    // Field order is teardown order
    projector: Box<dyn Projector>,
    context: Box<dyn ExecutionContext>,
    weights: Box<dyn Weights>,
}

impl LoadedSession {
    /// Builds weights, context and projector, in that order.
    ///
    /// On failure every handle created so far is released before the error
    /// is returned.
    pub fn build(
        backend: &dyn VisionBackend,
        variant: ModelVariant,
        artifacts: &ResolvedArtifacts,
        options: &SessionOptions,
    ) -> Result<Self> {
        // Locals drop in reverse order, so a failure part way releases the
        // context before the weights
        let weights = backend.load_weights(&artifacts.weights, options)?;
        debug!("Loaded weights: {}", weights.describe());

        let context = backend.new_context(weights.as_ref(), options)?;
        let projector = backend.load_projector(&artifacts.projector, weights.as_ref(), options)?;

        Ok(Self {
            variant,
            image_marker: backend.image_marker(),
            projector,
            context,
            weights,
        })
    }

    /// The variant this session serves
    pub fn variant(&self) -> &ModelVariant {
        &self.variant
    }

    /// Runs one generation to completion
    pub fn generate(&mut self, request: &GenerationRequest, cancel: &CancellationToken) -> Result<String> {
        let prompt = self.variant.render_prompt(&request.instruction, self.image_marker);
        let stop_sequences = self.variant.stop_sequences();

        let source = self.context.begin(
            self.weights.as_ref(),
            self.projector.as_ref(),
            &prompt,
            &request.image,
            &request.sampling,
        )?;
        let fragments = FragmentStream::new(source, request.sampling.max_tokens, cancel.clone());

        accumulate(fragments, stop_sequences)
    }
}

impl Drop for LoadedSession {
    fn drop(&mut self) {
        debug!("Releasing session for {}", self.variant.id);
    }
}
