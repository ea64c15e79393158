//! Caption orchestration
//!
//! Drives single images and whole batches through preprocessing, generation,
//! post-processing and persistence. Per-image failures become failed
//! outcomes; cancellation always propagates.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{BatchProgress, BatchSummary, CaptionOutcome, ItemStatus, SkipReason};
use common::utils::format_duration;
use config::AppConfig;
use inference_engine::{GenerationRequest, InferenceEngine, SamplingParams};
use model_manager::ModelVariant;

use crate::job::{CaptionJob, CaptionSettings};
use crate::postprocess::CaptionCleaner;
use crate::preprocess::{ImagePreprocessor, ImageSource};

/// Batch progress callback
pub type BatchProgressCallback<'a> = &'a (dyn Fn(BatchProgress) + Send + Sync);

/// Suffix of caption files being written
const CAPTION_TEMP_SUFFIX: &str = "tmp";

/// Clears the batch flag however the batch ends
struct BatchFlag<'a>(&'a AtomicBool);

impl Drop for BatchFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Turns caption jobs into ordered outcomes
pub struct CaptionOrchestrator {
    /// Session owner
    engine: Arc<InferenceEngine>,

    /// Image preparation
    preprocessor: Arc<dyn ImagePreprocessor>,

    /// Longest image side handed to the model
    max_dimension: u32,

    /// Token budget per caption
    max_tokens: usize,

    /// Set while a batch runs
    batch_running: AtomicBool,
}

impl CaptionOrchestrator {
    pub fn new(
        engine: Arc<InferenceEngine>,
        preprocessor: Arc<dyn ImagePreprocessor>,
        config: &AppConfig,
    ) -> Self {
        Self {
            engine,
            preprocessor,
            max_dimension: config.caption.max_image_dimension,
            max_tokens: config.inference.max_tokens,
            batch_running: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<InferenceEngine> {
        &self.engine
    }

    /// Whether a batch is in flight
    pub fn is_batch_running(&self) -> bool {
        self.batch_running.load(Ordering::SeqCst)
    }

    /// Captions one image with the currently loaded model.
    ///
    /// Returns `Err` only for cancellation; everything else is a failed
    /// outcome.
    pub async fn generate_one(
        &self,
        image: &Path,
        settings: &CaptionSettings,
        destination: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CaptionOutcome> {
        self.caption_image(image, settings, destination, None, cancel).await
    }

    /// Captions every image of a job, in order.
    ///
    /// Loads the job's variant first; a failed load aborts the batch. Rejects
    /// the call while another batch runs on this orchestrator.
    pub async fn generate_many(
        &self,
        job: &CaptionJob,
        on_progress: BatchProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CaptionOutcome>> {
        job.validate()?;
        let variant = self.engine.lifecycle().catalog().get(&job.variant)?.clone();

        if self
            .batch_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Validation("another batch is already running".to_string()));
        }
        let _flag = BatchFlag(&self.batch_running);

        self.engine.load(&variant.id, cancel).await?;

        let total = job.images.len();
        let started = Instant::now();
        info!("Captioning {} image(s) with {}", total, variant.id);

        let mut outcomes = Vec::with_capacity(total);
        for (index, image) in job.images.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Batch cancelled after {} of {} image(s)", index, total);
                return Err(Error::Cancelled);
            }

            on_progress(BatchProgress {
                index,
                total,
                image_path: image.clone(),
                status: ItemStatus::Started,
                outcome: None,
            });

            let caption_path = job.destination.caption_path(image)?;
            let outcome = if !job.overwrite && caption_path.exists() {
                debug!("Skipping {}, caption exists", image.display());
                CaptionOutcome::skipped(image.clone(), SkipReason::CaptionExists(caption_path))
            } else {
                self.caption_image(image, &job.settings, Some(&caption_path), Some(&variant), cancel)
                    .await?
            };

            on_progress(BatchProgress {
                index,
                total,
                image_path: image.clone(),
                status: status_of(&outcome),
                outcome: Some(outcome.clone()),
            });
            outcomes.push(outcome);
        }

        info!(
            "Batch finished in {}: {}",
            format_duration(started.elapsed()),
            BatchSummary::from_outcomes(&outcomes)
        );
        Ok(outcomes)
    }

    async fn caption_image(
        &self,
        image: &Path,
        settings: &CaptionSettings,
        destination: Option<&Path>,
        variant: Option<&ModelVariant>,
        cancel: &CancellationToken,
    ) -> Result<CaptionOutcome> {
        let failed = |error: &dyn std::fmt::Display| -> Result<CaptionOutcome> {
            warn!("Captioning {} failed: {}", image.display(), error);
            Ok(CaptionOutcome::failed(image.to_path_buf(), error.to_string()))
        };

        if image.as_os_str().is_empty() {
            return failed(&"empty image path");
        }
        if let Err(e) = settings.validate() {
            return failed(&e);
        }
        if variant.is_none() && !self.engine.is_loaded() {
            return failed(&Error::NotPresent("no model loaded".to_string()));
        }

        let cleaner = match CaptionCleaner::new(&settings.blacklist, settings.trigger_word.as_deref()) {
            Ok(cleaner) => cleaner,
            Err(e) => return failed(&e),
        };

        let prepared = match self
            .preprocessor
            .preprocess(ImageSource::Path(image.to_path_buf()), self.max_dimension)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => return failed(&e),
        };

        let mut guard = self.engine.lock_cancellable(cancel).await?;

        // Someone may have switched models since the batch loaded its own
        if let Some(variant) = variant {
            if guard.active_variant().map(|active| active.id != variant.id).unwrap_or(true) {
                if let Err(e) = guard.load(variant.clone(), cancel).await {
                    return if e.is_cancelled() { Err(e) } else { failed(&e) };
                }
            }
        }
        if guard.active_variant().is_none() {
            return failed(&Error::NotPresent("no model loaded".to_string()));
        }

        let request = GenerationRequest {
            instruction: settings.system_prompt.clone(),
            image: prepared.bytes,
            sampling: SamplingParams {
                temperature: settings.temperature,
                max_tokens: self.max_tokens,
                ..SamplingParams::default()
            },
        };

        let raw = match guard.generate(request, cancel).await {
            Ok(raw) => raw,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return failed(&e),
        };

        let caption = cleaner.clean(&raw);
        if caption.is_empty() {
            return failed(&Error::Generation("model produced an empty caption".to_string()));
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(path) = destination {
            if let Err(e) = write_caption(path, &caption).await {
                return failed(&e);
            }
        }
        drop(guard);

        debug!("Captioned {}", image.display());
        Ok(CaptionOutcome::succeeded(
            image.to_path_buf(),
            caption,
            destination.map(Path::to_path_buf),
        ))
    }
}

fn status_of(outcome: &CaptionOutcome) -> ItemStatus {
    if outcome.success {
        ItemStatus::Succeeded
    } else if outcome.is_skipped() {
        ItemStatus::Skipped
    } else {
        ItemStatus::Failed
    }
}

/// Writes a caption through a temporary sibling and renames it into place
async fn write_caption(path: &Path, caption: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".");
    temp_name.push(CAPTION_TEMP_SUFFIX);
    let temp = path.with_file_name(temp_name);

    let result = async {
        tokio::fs::write(&temp, caption.as_bytes()).await?;
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CaptionDestination;
    use crate::preprocess::StandardPreprocessor;
    use image::RgbImage;
    use inference_engine::scripted::ScriptedBackend;
    use model_manager::source::memory::MemoryArtifactSource;
    use model_manager::{ArtifactSpec, ModelCatalog, ModelLifecycleManager, PromptFamily};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Arc<ScriptedBackend>,
        orchestrator: Arc<CaptionOrchestrator>,
    }

    fn variant(id: &str) -> ModelVariant {
        ModelVariant {
            id: id.to_string(),
            display_name: id.to_string(),
            description: String::new(),
            family: PromptFamily::ChatMl,
            weights: ArtifactSpec {
                file_name: format!("{}.gguf", id),
                url: format!("mem://{}", id),
                expected_size: 64,
            },
            projector: ArtifactSpec {
                file_name: format!("{}.mmproj.gguf", id),
                url: format!("mem://{}/mmproj", id),
                expected_size: 8,
            },
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("tiny.gguf"), vec![0u8; 64]).unwrap();
        std::fs::write(models.join("tiny.mmproj.gguf"), vec![0u8; 8]).unwrap();

        let config = AppConfig {
            models_dir: models,
            ..AppConfig::default()
        };
        let catalog = ModelCatalog::new(vec![variant("tiny"), variant("absent")]).unwrap();
        let lifecycle = ModelLifecycleManager::new(
            Arc::new(catalog),
            Arc::new(MemoryArtifactSource::new(16)),
            &config,
        )
        .unwrap();

        let backend = Arc::new(ScriptedBackend::new());
        backend.set_fragments(&["<|im_start|>", "A red car", " driving fast", "<|im_end|>"]);
        let engine = Arc::new(InferenceEngine::new(
            backend.clone(),
            Arc::new(lifecycle),
            config.inference.clone(),
        ));
        let orchestrator = Arc::new(CaptionOrchestrator::new(
            engine,
            Arc::new(StandardPreprocessor),
            &config,
        ));

        Fixture {
            dir,
            backend,
            orchestrator,
        }
    }

    fn images(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                RgbImage::from_pixel(32, 24, image::Rgb([10, 200, 30])).save(&path).unwrap();
                path
            })
            .collect()
    }

    fn settings() -> CaptionSettings {
        CaptionSettings {
            trigger_word: Some("photo".to_string()),
            blacklist: vec!["red".to_string()],
            ..CaptionSettings::new("Describe the image.")
        }
    }

    fn ignore(_: BatchProgress) {}

    #[tokio::test]
    async fn test_batch_skips_existing_caption() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png", "b.png", "c.png"]);
        std::fs::write(f.dir.path().join("b.txt"), "hand written").unwrap();

        let events = Mutex::new(Vec::new());
        let record = |p: BatchProgress| events.lock().push((p.index, p.status));
        let job = CaptionJob::new(paths.clone(), "tiny", settings());

        let outcomes = f
            .orchestrator
            .generate_many(&job, &record, &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<ItemStatus> = outcomes.iter().map(status_of).collect();
        assert_eq!(kinds, vec![ItemStatus::Succeeded, ItemStatus::Skipped, ItemStatus::Succeeded]);
        assert_eq!(outcomes[0].image_path, paths[0]);
        assert_eq!(outcomes[2].image_path, paths[2]);

        assert_eq!(
            std::fs::read_to_string(f.dir.path().join("a.txt")).unwrap(),
            "photo, A car driving fast"
        );
        assert_eq!(std::fs::read_to_string(f.dir.path().join("b.txt")).unwrap(), "hand written");
        assert_eq!(f.backend.counters().generations.load(Ordering::SeqCst), 2);

        assert_eq!(
            *events.lock(),
            vec![
                (0, ItemStatus::Started),
                (0, ItemStatus::Succeeded),
                (1, ItemStatus::Started),
                (1, ItemStatus::Skipped),
                (2, ItemStatus::Started),
                (2, ItemStatus::Succeeded),
            ]
        );
        assert!(!f.orchestrator.is_batch_running());
    }

    #[tokio::test]
    async fn test_overwrite_and_output_directory() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png"]);
        let out = f.dir.path().join("captions");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("a.txt"), "old").unwrap();

        let job = CaptionJob::new(paths, "tiny", settings())
            .with_destination(CaptionDestination::Directory(out.clone()))
            .with_overwrite(true);
        let outcomes = f
            .orchestrator
            .generate_many(&job, &ignore, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].output_path.as_deref(), Some(out.join("a.txt").as_path()));
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "photo, A car driving fast");
        assert!(!out.join("a.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_bad_image_fails_without_aborting_batch() {
        let f = fixture();
        let mut paths = images(f.dir.path(), &["a.png", "c.png"]);
        let broken = f.dir.path().join("b.png");
        std::fs::write(&broken, b"not a png").unwrap();
        paths.insert(1, broken);

        let outcomes = f
            .orchestrator
            .generate_many(&CaptionJob::new(paths, "tiny", settings()), &ignore, &CancellationToken::new())
            .await
            .unwrap();

        let summary = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(summary.to_string(), "2 succeeded, 0 skipped, 1 failed");
        assert!(outcomes[1].error.as_deref().unwrap().contains("decode"));
        assert_eq!(f.backend.counters().generations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_keeps_finished_captions() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png", "b.png", "c.png"]);
        f.backend.set_fragments(&["A", " slow", " caption", " that", " takes", " a", " while"]);
        f.backend.set_fragment_delay(Duration::from_millis(20));

        let cancel = CancellationToken::new();
        let on_progress = {
            let cancel = cancel.clone();
            move |p: BatchProgress| {
                if p.index == 1 && p.status == ItemStatus::Started {
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        cancel.cancel();
                    });
                }
            }
        };

        let err = f
            .orchestrator
            .generate_many(&CaptionJob::new(paths, "tiny", settings()), &on_progress, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(f.dir.path().join("a.txt").exists());
        assert!(!f.dir.path().join("b.txt").exists());
        assert!(!f.dir.path().join("b.txt.tmp").exists());
        assert!(!f.dir.path().join("c.txt").exists());
        assert!(!f.orchestrator.is_batch_running());
    }

    #[tokio::test]
    async fn test_second_batch_rejected_while_running() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png", "b.png"]);
        f.backend.set_fragment_delay(Duration::from_millis(30));
        let job = CaptionJob::new(paths, "tiny", settings());

        let running = {
            let orchestrator = f.orchestrator.clone();
            let job = job.clone();
            tokio::spawn(async move {
                orchestrator
                    .generate_many(&job, &ignore, &CancellationToken::new())
                    .await
            })
        };

        while !f.orchestrator.is_batch_running() {
            tokio::task::yield_now().await;
        }
        let err = f
            .orchestrator
            .generate_many(&job.clone().with_overwrite(true), &ignore, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(running.await.unwrap().unwrap().len(), 2);
        assert!(!f.orchestrator.is_batch_running());
    }

    #[tokio::test]
    async fn test_load_failure_aborts_batch() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png"]);

        let err = f
            .orchestrator
            .generate_many(&CaptionJob::new(paths, "absent", settings()), &ignore, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_not_present());
        assert!(!f.dir.path().join("a.txt").exists());
        assert!(!f.orchestrator.is_batch_running());
    }

    #[tokio::test]
    async fn test_generate_one_requires_loaded_model() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png"]);
        let cancel = CancellationToken::new();

        let outcome = f
            .orchestrator
            .generate_one(&paths[0], &settings(), None, &cancel)
            .await
            .unwrap();
        assert!(outcome.is_failed());
        assert_eq!(f.backend.counters().generations.load(Ordering::SeqCst), 0);

        f.orchestrator.engine().load("tiny", &cancel).await.unwrap();
        let outcome = f
            .orchestrator
            .generate_one(&paths[0], &settings(), None, &cancel)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.caption.as_deref(), Some("photo, A car driving fast"));
        assert!(outcome.output_path.is_none());
        assert!(!f.dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_generation_failure_becomes_outcome() {
        let f = fixture();
        let paths = images(f.dir.path(), &["a.png"]);
        f.backend.fail_generation(true);

        let outcomes = f
            .orchestrator
            .generate_many(&CaptionJob::new(paths, "tiny", settings()), &ignore, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcomes[0].is_failed());
        assert!(!f.dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_invalid_job_rejected() {
        let f = fixture();
        let job = CaptionJob::new(Vec::new(), "tiny", settings());
        let err = f
            .orchestrator
            .generate_many(&job, &ignore, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let job = CaptionJob::new(vec![PathBuf::from("a.png")], "nope", settings());
        let err = f
            .orchestrator
            .generate_many(&job, &ignore, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
