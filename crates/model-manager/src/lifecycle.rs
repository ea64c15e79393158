//! Model artifact lifecycle
//!
//! Tracks which variants are on disk, fetches missing artifacts and removes
//! them again. At most one download per variant runs at a time.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{DownloadProgress, ModelArtifactState};
use common::utils::{file_size, format_bytes};
use config::AppConfig;

use crate::catalog::{ArtifactSpec, ModelCatalog, ModelVariant};
use crate::downloader::{self, ProgressCallback, ProgressTracker, TEMP_SUFFIX};
use crate::source::ArtifactSource;

/// Weights smaller than this share of the expected size count as corrupted
pub const MIN_COMPLETE_RATIO: f64 = 0.8;

/// Local paths of a variant that is ready to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifacts {
    /// Language model weights
    pub weights: PathBuf,

    /// Multimodal projector
    pub projector: PathBuf,
}

/// Clears a variant's in-flight flag when the download ends, however it ends
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Manages model artifacts under the models directory
pub struct ModelLifecycleManager {
    /// Known variants
    catalog: Arc<ModelCatalog>,

    /// Root of all artifact files
    models_dir: PathBuf,

    /// Where artifacts come from
    source: Arc<dyn ArtifactSource>,

    /// Variants with a download in flight
    in_flight: Mutex<HashSet<String>>,

    /// Minimum delay between progress emissions
    progress_interval: Duration,

    /// Free space to keep beyond the download size
    free_space_margin: u64,
}

impl ModelLifecycleManager {
    /// Creates a manager rooted at the configured models directory
    pub fn new(
        catalog: Arc<ModelCatalog>,
        source: Arc<dyn ArtifactSource>,
        config: &AppConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.models_dir).map_err(|e| {
            Error::Configuration(format!(
                "cannot create models directory {}: {}",
                config.models_dir.display(),
                e
            ))
        })?;

        let manager = Self {
            catalog,
            models_dir: config.models_dir.clone(),
            source,
            in_flight: Mutex::new(HashSet::new()),
            progress_interval: Duration::from_millis(config.download.progress_interval_ms),
            free_space_margin: config.download.min_free_space_margin_bytes,
        };
        manager.sweep_stale_temporaries();

        Ok(manager)
    }

    /// The catalog this manager serves
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Root of all artifact files
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Whether a download of `id` is in flight
    pub fn is_downloading(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }

    /// Current state of a variant's artifacts
    pub fn query_state(&self, id: &str) -> Result<ModelArtifactState> {
        let variant = self.catalog.get(id)?;
        if self.is_downloading(id) {
            return Ok(ModelArtifactState::Downloading);
        }
        Ok(self.inspect(variant))
    }

    /// Filesystem-only classification of a variant
    pub fn inspect(&self, variant: &ModelVariant) -> ModelArtifactState {
        let weights = variant.weights_path(&self.models_dir);
        let projector = variant.projector_path(&self.models_dir);

        if !weights.is_file() || !projector.is_file() {
            return ModelArtifactState::NotPresent;
        }

        if !is_complete(file_size(&weights), variant.weights.expected_size) {
            return ModelArtifactState::Corrupted;
        }

        ModelArtifactState::Present
    }

    /// Paths of a variant that is Present, or NotPresent
    pub fn resolve(&self, id: &str) -> Result<ResolvedArtifacts> {
        let variant = self.catalog.get(id)?;
        match self.query_state(id)? {
            ModelArtifactState::Present | ModelArtifactState::Loaded => Ok(ResolvedArtifacts {
                weights: variant.weights_path(&self.models_dir),
                projector: variant.projector_path(&self.models_dir),
            }),
            state => Err(Error::NotPresent(format!("{} is {}", id, state))),
        }
    }

    /// Bytes currently on disk for a variant
    pub fn size_on_disk(&self, id: &str) -> Result<u64> {
        let variant = self.catalog.get(id)?;
        Ok(file_size(&variant.weights_path(&self.models_dir))
            + file_size(&variant.projector_path(&self.models_dir)))
    }

    /// Downloads whatever part of a variant is missing.
    ///
    /// Progress is reported as one combined figure across both artifacts.
    /// Returns `DownloadInProgress` if another download of the same variant is
    /// running, and `Cancelled` if `cancel` fires; no partial file survives
    /// either failure or cancellation.
    pub async fn download(
        &self,
        id: &str,
        on_progress: ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let variant = self.catalog.get(id)?;

        let _guard = {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(id.to_string()) {
                return Err(Error::DownloadInProgress(id.to_string()));
            }
            InFlightGuard {
                set: &self.in_flight,
                id: id.to_string(),
            }
        };

        let mut tracker = ProgressTracker::new(
            variant.expected_total_size(),
            self.progress_interval,
            on_progress,
        );

        if self.inspect(variant) == ModelArtifactState::Present {
            debug!("{} already present, nothing to download", id);
            tracker.finish("Already downloaded");
            return Ok(());
        }

        // Projector first: it is small and fails fast on a bad URL
        let pending: Vec<&ArtifactSpec> = [&variant.projector, &variant.weights]
            .into_iter()
            .filter(|spec| {
                let done = is_complete(file_size(&spec.local_path(&self.models_dir)), spec.expected_size);
                if done {
                    tracker.skip(spec.expected_size);
                }
                !done
            })
            .collect();

        let needed: u64 = pending.iter().map(|spec| spec.expected_size).sum();
        self.ensure_free_space(needed)?;

        info!(
            variant = %id,
            artifacts = pending.len(),
            "Downloading {}",
            format_bytes(needed)
        );
        tracker.emit(&format!("Starting download of {}", variant.display_name));

        for spec in pending {
            let dest = spec.local_path(&self.models_dir);
            if let Err(e) =
                downloader::fetch_artifact(self.source.as_ref(), spec, &dest, &mut tracker, cancel).await
            {
                if e.is_cancelled() {
                    info!("Download of {} cancelled", id);
                } else {
                    warn!(variant = %id, error = %e, "Download failed");
                }
                return Err(e);
            }
        }

        tracker.finish("Download complete");
        info!("Downloaded {}", id);

        Ok(())
    }

    /// Removes both artifact files of a variant.
    ///
    /// Does not know about loaded sessions; callers unload first.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let variant = self.catalog.get(id)?;
        if self.is_downloading(id) {
            return Err(Error::DownloadInProgress(id.to_string()));
        }

        for spec in [&variant.weights, &variant.projector] {
            let path = spec.local_path(&self.models_dir);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("Deleted {}", id);
        Ok(())
    }

    fn ensure_free_space(&self, needed: u64) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }

        let required = needed.saturating_add(self.free_space_margin);
        match fs2::available_space(&self.models_dir) {
            Ok(available) if available < required => Err(Error::Download(format!(
                "not enough disk space in {}: need {}, {} available",
                self.models_dir.display(),
                format_bytes(required),
                format_bytes(available)
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Could not determine free space: {}", e);
                Ok(())
            }
        }
    }

    /// Removes `*.download` leftovers from interrupted runs
    fn sweep_stale_temporaries(&self) {
        let Ok(entries) = std::fs::read_dir(&self.models_dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(TEMP_SUFFIX) {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Removed stale {}", path.display()),
                    Err(e) => warn!("Failed to remove stale {}: {}", path.display(), e),
                }
            }
        }
    }
}

fn is_complete(actual: u64, expected: u64) -> bool {
    actual > 0 && actual as f64 >= expected as f64 * MIN_COMPLETE_RATIO
}
