//! Native backend seam
//!
//! The engine never talks to a runtime directly. A [`VisionBackend`] hands out
//! opaque handles for weights, execution context and multimodal projector, and
//! the engine decides when they are created and in which order they die.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::Path;

use common::error::{Error, Result};
use config::InferenceConfig;

/// Result of the one-time accelerator probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    /// Whether layers can be offloaded
    pub available: bool,

    /// Human readable device or runtime name
    pub name: String,
}

impl AcceleratorInfo {
    /// Host-only execution
    pub fn host() -> Self {
        Self {
            available: false,
            name: "CPU".to_string(),
        }
    }
}

impl fmt::Display for AcceleratorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.available {
            write!(f, "{} (offload available)", self.name)
        } else {
            write!(f, "{} (host only)", self.name)
        }
    }
}

/// Parameters fixed for the lifetime of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Context window in tokens
    pub context_size: u32,

    /// Prompt evaluation batch size
    pub batch_size: u32,

    /// Layers to offload; zero means host only
    pub gpu_layers: u32,

    /// Worker threads; zero lets the runtime decide
    pub threads: u32,
}

impl SessionOptions {
    /// Derives session options from configuration and the probed accelerator
    pub fn resolve(config: &InferenceConfig, accelerator: &AcceleratorInfo) -> Self {
        let offload = accelerator.available && !config.force_cpu;
        Self {
            context_size: config.context_size,
            batch_size: config.batch_size,
            gpu_layers: if offload { config.gpu_layers } else { 0 },
            threads: config.threads,
        }
    }

    /// Whether any layer is offloaded
    pub fn offloads(&self) -> bool {
        self.gpu_layers > 0
    }
}

/// Sampling settings for one generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Softmax temperature; zero is greedy
    pub temperature: f32,

    /// Token budget
    pub max_tokens: usize,

    /// Sampler seed
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 300,
            seed: 1234,
        }
    }
}

/// Loaded language model weights
pub trait Weights: Send {
    /// Short description for logs
    fn describe(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// Loaded multimodal projector
pub trait Projector: Send {
    fn as_any(&self) -> &dyn Any;
}

/// Produces generated text one fragment at a time.
///
/// `Ok(None)` marks the natural end of generation; the source is not
/// restartable afterwards.
pub trait FragmentSource {
    fn next_fragment(&mut self) -> Result<Option<String>>;
}

/// Execution context bound to one set of weights
pub trait ExecutionContext: Send {
    /// Evaluates the prompt and image and returns the generated fragments
    fn begin<'a>(
        &'a mut self,
        weights: &'a dyn Weights,
        projector: &'a dyn Projector,
        prompt: &str,
        image: &[u8],
        sampling: &SamplingParams,
    ) -> Result<Box<dyn FragmentSource + 'a>>;
}

/// A native runtime able to run vision-language models.
///
/// All methods block; the engine calls them from the blocking pool.
pub trait VisionBackend: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &'static str;

    /// Reports whether an accelerator is usable
    fn probe_accelerator(&self) -> AcceleratorInfo;

    /// Marker the prompt uses where the image goes
    fn image_marker(&self) -> &'static str;

    fn load_weights(&self, path: &Path, options: &SessionOptions) -> Result<Box<dyn Weights>>;

    fn new_context(
        &self,
        weights: &dyn Weights,
        options: &SessionOptions,
    ) -> Result<Box<dyn ExecutionContext>>;

    fn load_projector(
        &self,
        path: &Path,
        weights: &dyn Weights,
        options: &SessionOptions,
    ) -> Result<Box<dyn Projector>>;
}

/// Backend used when the binary was built without a native runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl UnavailableBackend {
    fn unavailable<T>() -> Result<T> {
        Err(Error::Load(
            "no inference runtime compiled in; rebuild with `--features llama`".to_string(),
        ))
    }
}

impl VisionBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn probe_accelerator(&self) -> AcceleratorInfo {
        AcceleratorInfo::host()
    }

    fn image_marker(&self) -> &'static str {
        "<image>"
    }

    fn load_weights(&self, _path: &Path, _options: &SessionOptions) -> Result<Box<dyn Weights>> {
        Self::unavailable()
    }

    fn new_context(
        &self,
        _weights: &dyn Weights,
        _options: &SessionOptions,
    ) -> Result<Box<dyn ExecutionContext>> {
        Self::unavailable()
    }

    fn load_projector(
        &self,
        _path: &Path,
        _weights: &dyn Weights,
        _options: &SessionOptions,
    ) -> Result<Box<dyn Projector>> {
        Self::unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_cpu_disables_offload() {
        let accelerator = AcceleratorInfo {
            available: true,
            name: "CUDA".to_string(),
        };
        let mut config = InferenceConfig::default();

        let options = SessionOptions::resolve(&config, &accelerator);
        assert!(options.offloads());
        assert_eq!(options.gpu_layers, config.gpu_layers);

        config.force_cpu = true;
        assert!(!SessionOptions::resolve(&config, &accelerator).offloads());
        assert!(!SessionOptions::resolve(&InferenceConfig::default(), &AcceleratorInfo::host()).offloads());
    }

    #[test]
    fn test_unavailable_backend_fails_to_load() {
        let options = SessionOptions::resolve(&InferenceConfig::default(), &AcceleratorInfo::host());
        let err = UnavailableBackend
            .load_weights(Path::new("/models/x.gguf"), &options)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Load(msg) if msg.contains("llama")));
    }
}
