//! llama.cpp backend
//!
//! GGUF weights through `llama-cpp-2`, images through its `mtmd` multimodal
//! helpers. A fresh `LlamaContext` is created per generation from the fixed
//! session parameters, so no KV cache survives between images.

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{LlamaModel, Special};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use std::any::Any;
use std::ffi::CString;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use common::error::{Error, Result};

use crate::backend::{
    AcceleratorInfo, ExecutionContext, FragmentSource, Projector, SamplingParams, SessionOptions,
    VisionBackend, Weights,
};

/// llama.cpp runtime; initialise once per process
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self> {
        let mut backend =
            LlamaBackend::init().map_err(|e| Error::Load(format!("llama.cpp init failed: {}", e)))?;
        backend.void_logs();

        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Load(format!("non UTF-8 path {}", path.display())))
}

pub struct LlamaWeights {
    model: LlamaModel,
    name: String,
}

// SAFETY: the model is immutable after loading and only used while the
// engine's inference lock is held.
unsafe impl Send for LlamaWeights {}

impl Weights for LlamaWeights {
    fn describe(&self) -> String {
        format!("{} ({} params)", self.name, self.model.n_params())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LlamaProjector {
    ctx: MtmdContext,
}

// SAFETY: see `LlamaWeights`; the projector context is never shared.
unsafe impl Send for LlamaProjector {}

impl Projector for LlamaProjector {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LlamaExecutionContext {
    backend: Arc<LlamaBackend>,
    params: SessionOptions,
}

fn downcast<'a, T: 'static>(handle: &'a dyn Any, what: &str) -> Result<&'a T> {
    handle
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Generation(format!("{} handle from another backend", what)))
}

impl ExecutionContext for LlamaExecutionContext {
    fn begin<'a>(
        &'a mut self,
        weights: &'a dyn Weights,
        projector: &'a dyn Projector,
        prompt: &str,
        image: &[u8],
        sampling: &SamplingParams,
    ) -> Result<Box<dyn FragmentSource + 'a>> {
        let model = &downcast::<LlamaWeights>(weights.as_any(), "weights")?.model;
        let mtmd = &downcast::<LlamaProjector>(projector.as_any(), "projector")?.ctx;

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.params.context_size))
            .with_n_batch(self.params.batch_size);
        if self.params.threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(self.params.threads as i32)
                .with_n_threads_batch(self.params.threads as i32);
        }

        let ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| Error::Generation(format!("failed to create context: {}", e)))?;

        let bitmap = MtmdBitmap::from_buffer(mtmd, image)
            .map_err(|e| Error::Generation(format!("image rejected by projector: {}", e)))?;
        let chunks = mtmd
            .tokenize(
                MtmdInputText {
                    text: prompt.to_string(),
                    add_special: true,
                    parse_special: true,
                },
                &[&bitmap],
            )
            .map_err(|e| Error::Generation(format!("tokenization failed: {}", e)))?;

        let n_past = chunks
            .eval_chunks(mtmd, &ctx, 0, 0, self.params.batch_size as i32, true)
            .map_err(|e| Error::Generation(format!("prompt evaluation failed: {}", e)))?;
        debug!("Prompt evaluated, {} positions", n_past);

        let sampler = if sampling.temperature <= 0.0 {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::temp(sampling.temperature),
                LlamaSampler::dist(sampling.seed),
            ])
        };

        Ok(Box::new(LlamaFragments {
            model,
            ctx,
            sampler,
            batch: LlamaBatch::new(1, 1),
            n_past,
            pending: Vec::new(),
            done: false,
        }))
    }
}

/// Token-by-token sampling loop
struct LlamaFragments<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    sampler: LlamaSampler,
    batch: LlamaBatch,
    n_past: i32,

    /// Bytes of a UTF-8 sequence split across tokens
    pending: Vec<u8>,
    done: bool,
}

impl FragmentSource for LlamaFragments<'_> {
    fn next_fragment(&mut self) -> Result<Option<String>> {
        loop {
            if self.done {
                return Ok(None);
            }

            let token = self.sampler.sample(&self.ctx, -1);
            self.sampler.accept(token);

            if self.model.is_eog_token(token) {
                self.done = true;
                return Ok(None);
            }

            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| Error::Generation(format!("token decoding failed: {}", e)))?;
            self.pending.extend_from_slice(&bytes);

            self.batch.clear();
            self.batch
                .add(token, self.n_past, &[0], true)
                .map_err(|e| Error::Generation(format!("failed to add token: {}", e)))?;
            self.ctx
                .decode(&mut self.batch)
                .map_err(|e| Error::Generation(format!("decode failed: {}", e)))?;
            self.n_past += 1;

            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    let text = text.to_string();
                    self.pending.clear();
                    return Ok(Some(text));
                }
                // Incomplete sequence; wait for the next token
                Err(e) if e.error_len().is_none() => continue,
                Err(_) => {
                    let text = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    return Ok(Some(text));
                }
            }
        }
    }
}

impl VisionBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn probe_accelerator(&self) -> AcceleratorInfo {
        if self.backend.supports_gpu_offload() {
            AcceleratorInfo {
                available: true,
                name: if cfg!(feature = "cuda") { "CUDA" } else { "GPU" }.to_string(),
            }
        } else {
            AcceleratorInfo::host()
        }
    }

    fn image_marker(&self) -> &'static str {
        mtmd_default_marker()
    }

    fn load_weights(&self, path: &Path, options: &SessionOptions) -> Result<Box<dyn Weights>> {
        let params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &params)
            .map_err(|e| Error::Load(format!("failed to load {}: {}", path.display(), e)))?;

        Ok(Box::new(LlamaWeights {
            model,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }))
    }

    fn new_context(
        &self,
        _weights: &dyn Weights,
        options: &SessionOptions,
    ) -> Result<Box<dyn ExecutionContext>> {
        Ok(Box::new(LlamaExecutionContext {
            backend: self.backend.clone(),
            params: options.clone(),
        }))
    }

    fn load_projector(
        &self,
        path: &Path,
        weights: &dyn Weights,
        options: &SessionOptions,
    ) -> Result<Box<dyn Projector>> {
        let model = &weights
            .as_any()
            .downcast_ref::<LlamaWeights>()
            .ok_or_else(|| Error::Load("weights handle from another backend".to_string()))?
            .model;

        let params = MtmdContextParams {
            use_gpu: options.offloads(),
            print_timings: false,
            n_threads: if options.threads > 0 { options.threads as i32 } else { 4 },
            media_marker: CString::new(mtmd_default_marker())
                .map_err(|e| Error::Load(format!("invalid media marker: {}", e)))?,
        };

        let ctx = MtmdContext::init_from_file(path_str(path)?, model, &params)
            .map_err(|e| Error::Load(format!("failed to load projector {}: {}", path.display(), e)))?;
        if !ctx.support_vision() {
            return Err(Error::Load(format!("{} has no vision encoder", path.display())));
        }

        Ok(Box::new(LlamaProjector { ctx }))
    }
}
