//! Caption jobs
//!
//! A [`CaptionJob`] describes one batch: which images, which variant, and how
//! the captions are shaped and stored. Jobs are validated before any work
//! starts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::error::{Error, Result};

/// Extension of caption files
pub const CAPTION_EXTENSION: &str = "txt";

/// Where caption files go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionDestination {
    /// Next to the source image
    #[default]
    BesideImage,

    /// Inside a fixed directory
    Directory(PathBuf),
}

impl CaptionDestination {
    /// `<dir>/<image-stem>.txt` for an image
    pub fn caption_path(&self, image: &Path) -> Result<PathBuf> {
        let stem = image
            .file_stem()
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| Error::Validation(format!("{} has no file name", image.display())))?;

        let dir = match self {
            CaptionDestination::BesideImage => image.parent().unwrap_or_else(|| Path::new("")),
            CaptionDestination::Directory(dir) => dir.as_path(),
        };

        let mut name = stem.to_os_string();
        name.push(".");
        name.push(CAPTION_EXTENSION);
        Ok(dir.join(name))
    }
}

/// Text shaping shared by every image of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionSettings {
    /// Instruction given to the model
    pub system_prompt: String,

    /// Prefix for every caption
    pub trigger_word: Option<String>,

    /// Words removed from captions
    pub blacklist: Vec<String>,

    /// Sampling temperature
    pub temperature: f32,
}

impl CaptionSettings {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            trigger_word: None,
            blacklist: Vec::new(),
            temperature: 0.7,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_prompt.trim().is_empty() {
            return Err(Error::Validation("system prompt is empty".to_string()));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Validation(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// One batch of images to caption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionJob {
    /// Images, in output order
    pub images: Vec<PathBuf>,

    /// Variant id
    pub variant: String,

    /// Caption shaping
    pub settings: CaptionSettings,

    /// Caption file placement
    pub destination: CaptionDestination,

    /// Replace existing caption files
    pub overwrite: bool,
}

impl CaptionJob {
    pub fn new(images: Vec<PathBuf>, variant: impl Into<String>, settings: CaptionSettings) -> Self {
        Self {
            images,
            variant: variant.into(),
            settings,
            destination: CaptionDestination::default(),
            overwrite: false,
        }
    }

    pub fn with_destination(mut self, destination: CaptionDestination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Rejects malformed jobs before any model work
    pub fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(Error::Validation("no images given".to_string()));
        }
        if self.variant.trim().is_empty() {
            return Err(Error::Validation("no model variant given".to_string()));
        }
        self.settings.validate()?;

        let mut seen: HashMap<PathBuf, &Path> = HashMap::new();
        for image in &self.images {
            if image.as_os_str().is_empty() {
                return Err(Error::Validation("empty image path".to_string()));
            }

            let caption = self.destination.caption_path(image)?;
            if let Some(previous) = seen.insert(caption.clone(), image) {
                return Err(Error::Validation(format!(
                    "{} and {} would both write {}",
                    previous.display(),
                    image.display(),
                    caption.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(images: &[&str]) -> CaptionJob {
        CaptionJob::new(
            images.iter().map(PathBuf::from).collect(),
            "qwen2.5-vl-3b",
            CaptionSettings::new("Describe the image."),
        )
    }

    #[test]
    fn test_caption_paths() {
        let image = Path::new("/data/set/cat.01.png");
        assert_eq!(
            CaptionDestination::BesideImage.caption_path(image).unwrap(),
            PathBuf::from("/data/set/cat.01.txt")
        );
        assert_eq!(
            CaptionDestination::Directory(PathBuf::from("/out"))
                .caption_path(image)
                .unwrap(),
            PathBuf::from("/out/cat.01.txt")
        );
        assert!(CaptionDestination::BesideImage.caption_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_valid_job() {
        assert!(job(&["a.png", "b.jpg"]).validate().is_ok());
    }

    #[test]
    fn test_malformed_jobs_rejected() {
        assert!(matches!(job(&[]).validate(), Err(Error::Validation(_))));
        assert!(matches!(job(&[""]).validate(), Err(Error::Validation(_))));

        let mut bad = job(&["a.png"]);
        bad.variant = " ".to_string();
        assert!(bad.validate().is_err());

        let mut bad = job(&["a.png"]);
        bad.settings.temperature = 3.5;
        assert!(bad.validate().is_err());

        let mut bad = job(&["a.png"]);
        bad.settings.system_prompt = "\n".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_colliding_caption_files_rejected() {
        let err = job(&["shots/a.png", "shots/a.jpg"]).validate().unwrap_err();
        assert!(err.to_string().contains("a.txt"));

        let flat = job(&["one/a.png", "two/a.png"]).with_destination(CaptionDestination::Directory("out".into()));
        assert!(flat.validate().is_err());
        assert!(job(&["one/a.png", "two/a.png"]).validate().is_ok());
    }
}
