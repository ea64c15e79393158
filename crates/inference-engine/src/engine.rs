//! Inference engine
//!
//! Owns at most one [`LoadedSession`]. Load, unload and generation all go
//! through a single async mutex, so the session is never touched by two
//! operations at once. A lock-free mirror of the active variant serves casual
//! status reads.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use config::InferenceConfig;
use model_manager::{ModelLifecycleManager, ModelVariant};

use crate::backend::{AcceleratorInfo, SessionOptions, VisionBackend};
use crate::generation::GenerationRequest;
use crate::session::LoadedSession;

/// Single-session inference engine
pub struct InferenceEngine {
    /// Native runtime
    backend: Arc<dyn VisionBackend>,

    /// Resolves artifact paths
    lifecycle: Arc<ModelLifecycleManager>,

    /// Inference settings
    config: InferenceConfig,

    /// Probed once at construction
    accelerator: AcceleratorInfo,

    /// The exclusive inference lock and the session it guards. Blocking work
    /// carries the owned guard, so the lock outlives a dropped caller.
    session: Arc<Mutex<Option<LoadedSession>>>,

    /// Eventually consistent copy of the active variant id
    active: Arc<RwLock<Option<String>>>,
}

impl InferenceEngine {
    /// Creates an engine and probes the accelerator
    pub fn new(
        backend: Arc<dyn VisionBackend>,
        lifecycle: Arc<ModelLifecycleManager>,
        config: InferenceConfig,
    ) -> Self {
        let accelerator = backend.probe_accelerator();
        info!(
            "Inference backend {} on {}{}",
            backend.name(),
            accelerator,
            if config.force_cpu { ", offload disabled" } else { "" }
        );

        Self {
            backend,
            lifecycle,
            config,
            accelerator,
            session: Arc::new(Mutex::new(None)),
            active: Arc::new(RwLock::new(None)),
        }
    }

    /// Probed accelerator
    pub fn accelerator(&self) -> &AcceleratorInfo {
        &self.accelerator
    }

    /// Artifact lifecycle this engine resolves paths through
    pub fn lifecycle(&self) -> &Arc<ModelLifecycleManager> {
        &self.lifecycle
    }

    /// Options every session of this engine is built with
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::resolve(&self.config, &self.accelerator)
    }

    /// Whether a session is loaded; may lag a concurrent load or unload
    pub fn is_loaded(&self) -> bool {
        self.active.read().is_some()
    }

    /// Active variant id; may lag a concurrent load or unload
    pub fn active_variant(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Loads a variant, replacing any other loaded one.
    ///
    /// Loading the active variant again is a no-op. Any failure leaves the
    /// engine unloaded.
    pub async fn load(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let variant = self.lifecycle.catalog().get(id)?.clone();

        let mut guard = self.lock_cancellable(cancel).await?;
        guard.load(variant, cancel).await
    }

    /// Releases the loaded session, if any
    pub async fn unload(&self) {
        let mut guard = self.lock().await;
        guard.unload();
    }

    /// Acquires the exclusive inference lock
    pub async fn lock(&self) -> EngineGuard<'_> {
        EngineGuard {
            engine: self,
            slot: Some(self.session.clone().lock_owned().await),
        }
    }

    /// Acquires the exclusive inference lock unless cancelled first
    pub async fn lock_cancellable(&self, cancel: &CancellationToken) -> Result<EngineGuard<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = self.lock() => Ok(guard),
        }
    }

    fn set_active(&self, id: Option<&str>) {
        *self.active.write() = id.map(str::to_string);
    }
}

type SessionSlot = OwnedMutexGuard<Option<LoadedSession>>;

/// Exclusive access to the engine's session.
///
/// The owned lock guard is lent to the blocking pool for native work and
/// handed back when that work ends. It is gone only if such work panicked.
pub struct EngineGuard<'a> {
    engine: &'a InferenceEngine,
    slot: Option<SessionSlot>,
}

impl EngineGuard<'_> {
    /// Variant of the loaded session; authoritative while the guard is held
    pub fn active_variant(&self) -> Option<&ModelVariant> {
        self.slot
            .as_deref()
            .and_then(|slot| slot.as_ref())
            .map(|session| session.variant())
    }

    /// Loads `variant` under this guard
    pub async fn load(&mut self, variant: ModelVariant, cancel: &CancellationToken) -> Result<()> {
        if self.active_variant().map(|v| v.id == variant.id).unwrap_or(false) {
            debug!("{} already loaded", variant.id);
            return Ok(());
        }

        self.unload();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let artifacts = self.engine.lifecycle.resolve(&variant.id)?;
        let options = self.engine.session_options();
        let backend = self.engine.backend.clone();
        let active = self.engine.active.clone();
        let id = variant.id.clone();
        let mut slot = self.take_slot()?;

        info!(variant = %id, gpu_layers = options.gpu_layers, "Loading model");

        let loaded_id = id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = LoadedSession::build(backend.as_ref(), variant, &artifacts, &options)
                .map(|session| {
                    *slot = Some(session);
                    *active.write() = Some(loaded_id);
                });
            (slot, result)
        })
        .await;

        match joined {
            Ok((slot, result)) => {
                self.slot = Some(slot);
                result.map_err(|e| match e {
                    Error::Load(_) => e,
                    other => Error::Load(other.to_string()),
                })?;
            }
            Err(e) => return Err(Error::Load(format!("load task failed: {}", e))),
        }

        if cancel.is_cancelled() {
            self.unload();
            info!("Load of {} cancelled", id);
            return Err(Error::Cancelled);
        }

        info!("Loaded {}", id);

        Ok(())
    }

    /// Releases the session held under this guard
    pub fn unload(&mut self) {
        if let Some(session) = self.slot.as_deref_mut().and_then(Option::take) {
            let id = session.variant().id.clone();
            drop(session);
            info!("Unloaded {}", id);
        }
        self.engine.set_active(None);
    }

    /// Runs one generation on the blocking pool.
    ///
    /// The lock travels with the work, so dropping this future does not
    /// release it before generation ends.
    pub async fn generate(
        &mut self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.active_variant().is_none() {
            return Err(Error::NotPresent("no model loaded".to_string()));
        }

        let slot = self.take_slot()?;
        let active = self.engine.active.clone();
        let cancel = cancel.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            let lease = SessionLease {
                active,
                returned: false,
            };
            let result = match slot.take() {
                Some(mut session) => {
                    let result = session.generate(&request, &cancel);
                    *slot = Some(session);
                    result
                }
                None => Err(Error::NotPresent("no model loaded".to_string())),
            };
            lease.give_back();
            (slot, result)
        })
        .await;

        match joined {
            Ok((slot, result)) => {
                self.slot = Some(slot);
                result
            }
            Err(e) => {
                warn!("Generation task failed, session lost: {}", e);
                Err(Error::Generation(format!("generation task failed: {}", e)))
            }
        }
    }

    fn take_slot(&mut self) -> Result<SessionSlot> {
        self.slot
            .take()
            .ok_or_else(|| Error::Generation("inference lock lost to a failed task".to_string()))
    }
}

/// Marks the engine unloaded if generation unwinds with the session
struct SessionLease {
    active: Arc<RwLock<Option<String>>>,
    returned: bool,
}

impl SessionLease {
    fn give_back(mut self) {
        self.returned = true;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.returned {
            *self.active.write() = None;
        }
    }
}
