//! Common data models for Caption Studio
//!
//! This module defines the data model shared between the lifecycle manager,
//! the inference engine, the caption orchestrator and their callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// On-disk / in-memory state of a model variant's artifacts.
///
/// Always derived on demand and never persisted. `Loaded` implies `Present`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelArtifactState {
    /// One or both artifact files are missing
    NotPresent,
    /// A transfer for this variant is in flight
    Downloading,
    /// Both artifacts exist and the weights pass the size check
    Present,
    /// Both artifacts exist but the weights are too small
    Corrupted,
    /// Present and currently resident in the inference engine
    Loaded,
}

impl ModelArtifactState {
    /// Returns true if the artifacts can be loaded
    pub fn is_usable(&self) -> bool {
        matches!(self, ModelArtifactState::Present | ModelArtifactState::Loaded)
    }
}

impl fmt::Display for ModelArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelArtifactState::NotPresent => write!(f, "not downloaded"),
            ModelArtifactState::Downloading => write!(f, "downloading"),
            ModelArtifactState::Present => write!(f, "ready"),
            ModelArtifactState::Corrupted => write!(f, "corrupted"),
            ModelArtifactState::Loaded => write!(f, "loaded"),
        }
    }
}

/// Progress snapshot for a variant download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes transferred so far across both artifacts
    pub bytes_done: u64,

    /// Total bytes expected across both artifacts
    pub bytes_total: u64,

    /// Human readable status line
    pub message: String,
}

impl DownloadProgress {
    /// Fraction complete in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
    }

    /// Returns true once every byte has been accounted for
    pub fn is_complete(&self) -> bool {
        self.bytes_total > 0 && self.bytes_done >= self.bytes_total
    }
}

/// Listing entry returned to UI / CLI callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSummary {
    /// Catalog key
    pub id: String,

    /// Display name
    pub display_name: String,

    /// One-line description
    pub description: String,

    /// Current artifact state
    pub state: ModelArtifactState,

    /// Local weights path
    pub local_path: PathBuf,

    /// Bytes currently on disk across both artifacts
    pub size_bytes: u64,

    /// Expected bytes across both artifacts
    pub expected_size_bytes: u64,
}

/// Why an image was not captioned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    /// A caption file already exists and overwrite is disabled
    CaptionExists(PathBuf),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CaptionExists(path) => {
                write!(f, "caption already exists at {}", path.display())
            }
        }
    }
}

/// Result of captioning one image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptionOutcome {
    /// Whether a caption was produced
    pub success: bool,

    /// Source image
    pub image_path: PathBuf,

    /// Final caption text
    pub caption: Option<String>,

    /// Where the caption was written, if anywhere
    pub output_path: Option<PathBuf>,

    /// Failure description
    pub error: Option<String>,

    /// Set when the image was deliberately not processed
    pub skipped: Option<SkipReason>,
}

impl CaptionOutcome {
    /// Successful caption
    pub fn succeeded(image_path: PathBuf, caption: String, output_path: Option<PathBuf>) -> Self {
        Self {
            success: true,
            image_path,
            caption: Some(caption),
            output_path,
            error: None,
            skipped: None,
        }
    }

    /// Failed caption
    pub fn failed(image_path: PathBuf, error: impl Into<String>) -> Self {
        Self {
            success: false,
            image_path,
            caption: None,
            output_path: None,
            error: Some(error.into()),
            skipped: None,
        }
    }

    /// Skipped image
    pub fn skipped(image_path: PathBuf, reason: SkipReason) -> Self {
        Self {
            success: false,
            image_path,
            caption: None,
            output_path: None,
            error: None,
            skipped: Some(reason),
        }
    }

    /// Returns true if the image was skipped
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// Returns true if the image was attempted and failed
    pub fn is_failed(&self) -> bool {
        !self.success && self.skipped.is_none()
    }
}

/// Per-item status reported during a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    /// About to process the item
    Started,
    /// Caption written
    Succeeded,
    /// Item skipped
    Skipped,
    /// Item failed; the batch continues
    Failed,
}

/// Progress event emitted before and after every batch item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Zero-based index of the item
    pub index: usize,

    /// Number of items in the batch
    pub total: usize,

    /// Image being processed
    pub image_path: PathBuf,

    /// Item status
    pub status: ItemStatus,

    /// Outcome, present on the "after" event
    pub outcome: Option<CaptionOutcome>,
}

/// Aggregate counts for a finished batch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    /// Captions produced
    pub succeeded: usize,

    /// Images skipped
    pub skipped: usize,

    /// Images that failed
    pub failed: usize,
}

impl BatchSummary {
    /// Tallies a list of outcomes
    pub fn from_outcomes(outcomes: &[CaptionOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut acc, outcome| {
            if outcome.success {
                acc.succeeded += 1;
            } else if outcome.is_skipped() {
                acc.skipped += 1;
            } else {
                acc.failed += 1;
            }
            acc
        })
    }

    /// Number of processed items
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded, self.skipped, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let progress = DownloadProgress {
            bytes_done: 50,
            bytes_total: 200,
            message: String::new(),
        };
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);
        assert!(!progress.is_complete());

        let empty = DownloadProgress {
            bytes_done: 0,
            bytes_total: 0,
            message: String::new(),
        };
        assert_eq!(empty.fraction(), 0.0);
        assert!(!empty.is_complete());
    }

    #[test]
    fn test_batch_summary() {
        let outcomes = vec![
            CaptionOutcome::succeeded("a.png".into(), "a cat".to_string(), None),
            CaptionOutcome::skipped("b.png".into(), SkipReason::CaptionExists("b.txt".into())),
            CaptionOutcome::failed("c.png".into(), "decode failed"),
            CaptionOutcome::succeeded("d.png".into(), "a dog".to_string(), None),
        ];

        let summary = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.to_string(), "2 succeeded, 1 skipped, 1 failed");
    }

    #[test]
    fn test_state_usable() {
        assert!(ModelArtifactState::Present.is_usable());
        assert!(ModelArtifactState::Loaded.is_usable());
        assert!(!ModelArtifactState::Corrupted.is_usable());
        assert!(!ModelArtifactState::Downloading.is_usable());
    }
}
