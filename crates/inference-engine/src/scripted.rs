//! Scripted in-process backend for tests
//!
//! Hands out handles that only count themselves, and "generates" a fixed list
//! of fragments. Live-handle counters and the release log let tests assert
//! that sessions are torn down completely and in order.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::error::{Error, Result};

use crate::backend::{
    AcceleratorInfo, ExecutionContext, FragmentSource, Projector, SamplingParams, SessionOptions,
    VisionBackend, Weights,
};

/// Marker used in rendered prompts
pub const IMAGE_MARKER: &str = "<__image__>";

/// Observable side effects of the scripted backend
#[derive(Debug, Default)]
pub struct Counters {
    pub probes: AtomicUsize,
    pub weight_loads: AtomicUsize,
    pub live_weights: AtomicUsize,
    pub live_contexts: AtomicUsize,
    pub live_projectors: AtomicUsize,
    pub generations: AtomicUsize,

    /// `kind:file` per released handle, in release order
    pub releases: Mutex<Vec<String>>,

    /// Prompts seen by `begin`
    pub prompts: Mutex<Vec<String>>,

    /// Options of the last weight load
    pub last_options: Mutex<Option<SessionOptions>>,

    /// Sampling of the last generation
    pub last_sampling: Mutex<Option<SamplingParams>>,
}

impl Counters {
    /// Handles currently alive
    pub fn live_handles(&self) -> usize {
        self.live_weights.load(Ordering::SeqCst)
            + self.live_contexts.load(Ordering::SeqCst)
            + self.live_projectors.load(Ordering::SeqCst)
    }

    pub fn weight_loads(&self) -> usize {
        self.weight_loads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().clone()
    }

    fn live(&self, kind: &str) -> &AtomicUsize {
        match kind {
            "weights" => &self.live_weights,
            "context" => &self.live_contexts,
            _ => &self.live_projectors,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    fragments: Vec<String>,
    fragment_delay: Duration,
    fail_weights: bool,
    fail_projector: bool,
    fail_generation: bool,
}

/// Backend whose behaviour is set up by the test
pub struct ScriptedBackend {
    accelerator: AcceleratorInfo,
    counters: Arc<Counters>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            accelerator: AcceleratorInfo {
                available: true,
                name: "Scripted GPU".to_string(),
            },
            counters: Arc::new(Counters::default()),
            script: Arc::new(Mutex::new(Script {
                fragments: vec!["A scripted caption".to_string()],
                ..Script::default()
            })),
        }
    }

    pub fn without_accelerator(mut self) -> Self {
        self.accelerator = AcceleratorInfo::host();
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Fragments every generation yields
    pub fn set_fragments(&self, fragments: &[&str]) {
        self.script.lock().fragments = fragments.iter().map(|f| f.to_string()).collect();
    }

    /// Sleep between fragments
    pub fn set_fragment_delay(&self, delay: Duration) {
        self.script.lock().fragment_delay = delay;
    }

    pub fn fail_weights(&self, fail: bool) {
        self.script.lock().fail_weights = fail;
    }

    pub fn fail_projector(&self, fail: bool) {
        self.script.lock().fail_projector = fail;
    }

    pub fn fail_generation(&self, fail: bool) {
        self.script.lock().fail_generation = fail;
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts one live handle of a kind until dropped
struct Tracked {
    kind: &'static str,
    file: String,
    counters: Arc<Counters>,
}

impl Tracked {
    fn new(kind: &'static str, path: &Path, counters: &Arc<Counters>) -> Self {
        counters.live(kind).fetch_add(1, Ordering::SeqCst);
        Self {
            kind,
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            counters: counters.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.live(self.kind).fetch_sub(1, Ordering::SeqCst);
        self.counters
            .releases
            .lock()
            .push(format!("{}:{}", self.kind, self.file));
    }
}


pub struct ScriptedWeights {
    path: PathBuf,
    _tracked: Tracked,
}

impl Weights for ScriptedWeights {
    fn describe(&self) -> String {
        format!("scripted {}", self.path.display())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ScriptedProjector {
    _tracked: Tracked,
}

impl Projector for ScriptedProjector {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ScriptedContext {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    _tracked: Tracked,
}

impl ExecutionContext for ScriptedContext {
    fn begin<'a>(
        &'a mut self,
        weights: &'a dyn Weights,
        _projector: &'a dyn Projector,
        prompt: &str,
        image: &[u8],
        sampling: &SamplingParams,
    ) -> Result<Box<dyn FragmentSource + 'a>> {
        if weights.as_any().downcast_ref::<ScriptedWeights>().is_none() {
            return Err(Error::Generation("foreign weights handle".to_string()));
        }
        if image.is_empty() {
            return Err(Error::Generation("empty image".to_string()));
        }

        self.counters.generations.fetch_add(1, Ordering::SeqCst);
        self.counters.prompts.lock().push(prompt.to_string());
        *self.counters.last_sampling.lock() = Some(*sampling);

        let script = self.script.lock();
        Ok(Box::new(ScriptedFragments {
            fragments: script.fragments.iter().cloned().collect(),
            delay: script.fragment_delay,
            fail: script.fail_generation,
        }))
    }
}

struct ScriptedFragments {
    fragments: VecDeque<String>,
    delay: Duration,
    fail: bool,
}

impl FragmentSource for ScriptedFragments {
    fn next_fragment(&mut self) -> Result<Option<String>> {
        if self.fail {
            return Err(Error::Generation("scripted failure".to_string()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.fragments.pop_front())
    }
}

impl VisionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn probe_accelerator(&self) -> AcceleratorInfo {
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        self.accelerator.clone()
    }

    fn image_marker(&self) -> &'static str {
        IMAGE_MARKER
    }

    fn load_weights(&self, path: &Path, options: &SessionOptions) -> Result<Box<dyn Weights>> {
        if self.script.lock().fail_weights {
            return Err(Error::Load(format!("cannot map {}", path.display())));
        }
        self.counters.weight_loads.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_options.lock() = Some(options.clone());

        Ok(Box::new(ScriptedWeights {
            path: path.to_path_buf(),
            _tracked: Tracked::new("weights", path, &self.counters),
        }))
    }

    fn new_context(
        &self,
        weights: &dyn Weights,
        _options: &SessionOptions,
    ) -> Result<Box<dyn ExecutionContext>> {
        let weights = weights
            .as_any()
            .downcast_ref::<ScriptedWeights>()
            .ok_or_else(|| Error::Load("foreign weights handle".to_string()))?;

        Ok(Box::new(ScriptedContext {
            script: self.script.clone(),
            counters: self.counters.clone(),
            _tracked: Tracked::new("context", &weights.path, &self.counters),
        }))
    }

    fn load_projector(
        &self,
        path: &Path,
        _weights: &dyn Weights,
        _options: &SessionOptions,
    ) -> Result<Box<dyn Projector>> {
        if self.script.lock().fail_projector {
            return Err(Error::Load(format!("bad projector {}", path.display())));
        }

        Ok(Box::new(ScriptedProjector {
            _tracked: Tracked::new("projector", path, &self.counters),
        }))
    }
}
