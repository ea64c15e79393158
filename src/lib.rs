//! Main integration module for Caption Studio
//!
//! [`CaptionStudio`] wires the catalog, lifecycle manager, inference engine
//! and caption orchestrator together and exposes the operations UI and CLI
//! callers use.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use common::error::{Error, Result};
use common::models::{BatchProgress, CaptionOutcome, DownloadProgress, ModelArtifactState, VariantSummary};
use common::utils::file_size;
use config::{AppConfig, ConfigManager};
use inference_engine::{AcceleratorInfo, InferenceEngine, VisionBackend};
use model_manager::{ArtifactSource, HttpArtifactSource, ModelCatalog, ModelLifecycleManager};
use orchestrator_core::{
    CaptionDestination, CaptionJob, CaptionOrchestrator, CaptionSettings, ImagePreprocessor,
    StandardPreprocessor,
};

/// Caption Studio application core
pub struct CaptionStudio {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Artifact lifecycle
    lifecycle: Arc<ModelLifecycleManager>,

    /// Inference engine
    engine: Arc<InferenceEngine>,

    /// Caption orchestrator
    orchestrator: Arc<CaptionOrchestrator>,
}

impl CaptionStudio {
    /// Creates the application with the built-in catalog, HTTP downloads and
    /// the compiled-in inference backend
    pub fn new(config_manager: ConfigManager) -> Result<Self> {
        let source = Arc::new(HttpArtifactSource::new(&config_manager.config().download)?);
        let backend = inference_engine::default_backend()?;

        Self::with_components(
            config_manager,
            ModelCatalog::builtin(),
            source,
            backend,
            Arc::new(StandardPreprocessor),
        )
    }

    /// Creates the application from explicit parts
    pub fn with_components(
        config_manager: ConfigManager,
        catalog: ModelCatalog,
        source: Arc<dyn ArtifactSource>,
        backend: Arc<dyn VisionBackend>,
        preprocessor: Arc<dyn ImagePreprocessor>,
    ) -> Result<Self> {
        let config = config_manager.config();
        info!("Initializing Caption Studio, models in {}", config.models_dir.display());

        let lifecycle = Arc::new(ModelLifecycleManager::new(Arc::new(catalog), source, config)?);
        let engine = Arc::new(InferenceEngine::new(
            backend,
            lifecycle.clone(),
            config.inference.clone(),
        ));
        let orchestrator = Arc::new(CaptionOrchestrator::new(engine.clone(), preprocessor, config));

        Ok(Self {
            config_manager: Arc::new(config_manager),
            lifecycle,
            engine,
            orchestrator,
        })
    }

    /// Every known variant with its current state
    pub fn list_variants(&self) -> Result<Vec<VariantSummary>> {
        let models_dir = self.lifecycle.models_dir();

        self.lifecycle
            .catalog()
            .variants()
            .iter()
            .map(|variant| {
                let weights = variant.weights_path(models_dir);
                Ok(VariantSummary {
                    id: variant.id.clone(),
                    display_name: variant.display_name.clone(),
                    description: variant.description.clone(),
                    state: self.query_state(&variant.id)?,
                    size_bytes: file_size(&weights) + file_size(&variant.projector_path(models_dir)),
                    local_path: weights,
                    expected_size_bytes: variant.expected_total_size(),
                })
            })
            .collect()
    }

    /// Artifact state, reporting `Loaded` for the active variant
    pub fn query_state(&self, id: &str) -> Result<ModelArtifactState> {
        let state = self.lifecycle.query_state(id)?;
        let active = self.engine.active_variant();

        Ok(match state {
            ModelArtifactState::Present if active.as_deref() == Some(id) => ModelArtifactState::Loaded,
            other => other,
        })
    }

    /// Downloads a variant; `Ok(false)` if the download failed
    pub async fn download(
        &self,
        id: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match self.lifecycle.download(id, on_progress, cancel).await {
            Ok(()) => Ok(true),
            Err(e) => Self::absorb("Download", id, e),
        }
    }

    /// Loads a variant; `Ok(false)` if the load failed
    pub async fn load(&self, id: &str, cancel: &CancellationToken) -> Result<bool> {
        match self.engine.load(id, cancel).await {
            Ok(()) => Ok(true),
            Err(e) => Self::absorb("Load", id, e),
        }
    }

    /// Releases the loaded session, if any
    pub async fn unload(&self) {
        self.engine.unload().await;
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    pub fn active_variant(&self) -> Option<String> {
        self.engine.active_variant()
    }

    pub fn accelerator(&self) -> &AcceleratorInfo {
        self.engine.accelerator()
    }

    /// Captions one image with the loaded model
    pub async fn generate_one(
        &self,
        image: &Path,
        settings: &CaptionSettings,
        destination: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CaptionOutcome> {
        self.orchestrator
            .generate_one(image, settings, destination, cancel)
            .await
    }

    /// Captions a batch
    pub async fn generate_many(
        &self,
        job: &CaptionJob,
        on_progress: &(dyn Fn(BatchProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Vec<CaptionOutcome>> {
        self.orchestrator.generate_many(job, on_progress, cancel).await
    }

    /// Removes a variant's artifacts, unloading it first if it is active.
    ///
    /// The inference lock is held until the files are gone, so a concurrent
    /// load cannot resolve artifacts that are being deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.lifecycle.catalog().get(id)?;

        let mut guard = self.engine.lock().await;
        if guard.active_variant().map(|v| v.id == id).unwrap_or(false) {
            guard.unload();
        }

        self.lifecycle.delete(id).await
    }

    /// Caption settings from configuration
    pub fn default_settings(&self) -> CaptionSettings {
        let caption = &self.config().caption;
        CaptionSettings {
            temperature: caption.default_temperature,
            ..CaptionSettings::new(caption.default_system_prompt.clone())
        }
    }

    /// Destination rule from configuration
    pub fn default_destination(&self) -> CaptionDestination {
        match &self.config().caption.output_dir {
            Some(dir) => CaptionDestination::Directory(dir.clone()),
            None => CaptionDestination::BesideImage,
        }
    }

    pub fn config(&self) -> &AppConfig {
        self.config_manager.config()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        self.lifecycle.catalog()
    }

    fn absorb(operation: &str, id: &str, e: Error) -> Result<bool> {
        if e.is_cancelled() || e.is_configuration() {
            return Err(e);
        }
        error!("{} of {} failed: {}", operation, id, e);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_engine::scripted::ScriptedBackend;
    use model_manager::source::memory::MemoryArtifactSource;
    use model_manager::{ArtifactSpec, ModelVariant, PromptFamily};
    use std::path::PathBuf;

    fn variant(id: &str) -> ModelVariant {
        ModelVariant {
            id: id.to_string(),
            display_name: format!("Tiny {}", id),
            description: "tiny test model".to_string(),
            family: PromptFamily::Gemma,
            weights: ArtifactSpec {
                file_name: format!("{}.gguf", id),
                url: format!("mem://{}/weights", id),
                expected_size: 256,
            },
            projector: ArtifactSpec {
                file_name: format!("{}.mmproj.gguf", id),
                url: format!("mem://{}/projector", id),
                expected_size: 32,
            },
        }
    }

    fn studio(dir: &Path) -> (CaptionStudio, Arc<ScriptedBackend>) {
        let source = MemoryArtifactSource::new(64)
            .with_body("mem://tiny/weights", vec![1u8; 256])
            .with_body("mem://tiny/projector", vec![2u8; 32]);
        let backend = Arc::new(ScriptedBackend::new());
        let config = ConfigManager::from_config(AppConfig {
            models_dir: dir.join("models"),
            ..AppConfig::default()
        })
        .unwrap();

        let studio = CaptionStudio::with_components(
            config,
            ModelCatalog::new(vec![variant("tiny"), variant("offline")]).unwrap(),
            Arc::new(source),
            backend.clone(),
            Arc::new(StandardPreprocessor),
        )
        .unwrap();
        (studio, backend)
    }

    fn ignore(_: DownloadProgress) {}

    #[tokio::test]
    async fn test_download_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (studio, _backend) = studio(dir.path());
        let cancel = CancellationToken::new();

        assert_eq!(studio.query_state("tiny").unwrap(), ModelArtifactState::NotPresent);
        assert!(studio.download("tiny", &ignore, &cancel).await.unwrap());
        assert_eq!(studio.query_state("tiny").unwrap(), ModelArtifactState::Present);

        assert!(studio.load("tiny", &cancel).await.unwrap());
        assert_eq!(studio.query_state("tiny").unwrap(), ModelArtifactState::Loaded);

        let listing = studio.list_variants().unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].state, ModelArtifactState::Loaded);
        assert_eq!(listing[0].size_bytes, 288);
        assert_eq!(listing[0].expected_size_bytes, 288);
        assert_eq!(listing[0].local_path, dir.path().join("models").join("tiny.gguf"));
        assert_eq!(listing[1].state, ModelArtifactState::NotPresent);
    }

    #[tokio::test]
    async fn test_failures_are_reported_as_false() {
        let dir = tempfile::tempdir().unwrap();
        let (studio, _backend) = studio(dir.path());
        let cancel = CancellationToken::new();

        assert!(!studio.download("offline", &ignore, &cancel).await.unwrap());
        assert!(!studio.load("offline", &cancel).await.unwrap());
        assert!(studio.load("missing", &cancel).await.unwrap_err().is_configuration());

        cancel.cancel();
        assert!(studio.download("tiny", &ignore, &cancel).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_delete_active_variant_unloads_first() {
        let dir = tempfile::tempdir().unwrap();
        let (studio, backend) = studio(dir.path());
        let cancel = CancellationToken::new();

        studio.download("tiny", &ignore, &cancel).await.unwrap();
        studio.load("tiny", &cancel).await.unwrap();
        assert!(studio.is_loaded());

        studio.delete("tiny").await.unwrap();

        assert!(!studio.is_loaded());
        assert_eq!(studio.active_variant(), None);
        assert_eq!(backend.counters().live_handles(), 0);
        assert_eq!(studio.query_state("tiny").unwrap(), ModelArtifactState::NotPresent);
        assert!(!dir.path().join("models").join("tiny.gguf").exists());
        assert!(!dir.path().join("models").join("tiny.mmproj.gguf").exists());
    }

    #[tokio::test]
    async fn test_load_racing_delete_never_loads_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let (studio, backend) = studio(dir.path());
        let cancel = CancellationToken::new();

        studio.download("tiny", &ignore, &cancel).await.unwrap();
        studio.load("tiny", &cancel).await.unwrap();

        let (deleted, loaded) = tokio::join!(studio.delete("tiny"), studio.load("tiny", &cancel));
        deleted.unwrap();

        assert!(!loaded.unwrap());
        assert!(!studio.is_loaded());
        assert_eq!(backend.counters().live_handles(), 0);
        assert_eq!(studio.query_state("tiny").unwrap(), ModelArtifactState::NotPresent);
    }

    #[tokio::test]
    async fn test_delete_other_variant_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let (studio, _backend) = studio(dir.path());
        let cancel = CancellationToken::new();

        studio.download("tiny", &ignore, &cancel).await.unwrap();
        studio.load("tiny", &cancel).await.unwrap();
        studio.delete("offline").await.unwrap();

        assert_eq!(studio.active_variant().as_deref(), Some("tiny"));
    }

    #[test]
    fn test_defaults_follow_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let (studio, _backend) = studio(dir.path());

        let settings = studio.default_settings();
        assert_eq!(settings.system_prompt, studio.config().caption.default_system_prompt);
        assert_eq!(studio.default_destination(), CaptionDestination::BesideImage);
        assert!(studio.accelerator().available);

        let job = CaptionJob::new(vec![PathBuf::from("a.png")], "tiny", settings);
        assert!(job.validate().is_ok());
    }
}
