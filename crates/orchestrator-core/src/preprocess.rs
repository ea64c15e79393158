//! Image preprocessing
//!
//! Validates, decodes, downsizes and re-encodes images before they reach the
//! model. Decoding is CPU bound and runs on the blocking pool.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::path::PathBuf;
use tracing::debug;

use common::error::{Error, Result};

/// Smallest accepted width or height
pub const MIN_DIMENSION: u32 = 16;

/// Quality of re-encoded images
pub const JPEG_QUALITY: u8 = 90;

/// Where an image comes from
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// An image ready for the model
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Encoded image
    pub bytes: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Whether the image was downscaled
    pub was_resized: bool,
}

/// Turns a source image into model input
#[async_trait]
pub trait ImagePreprocessor: Send + Sync {
    /// Fails with `Error::Preprocessing` for missing, undecodable or tiny images
    async fn preprocess(&self, source: ImageSource, max_dimension: u32) -> Result<PreparedImage>;
}

/// Preprocessor built on the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPreprocessor;

#[async_trait]
impl ImagePreprocessor for StandardPreprocessor {
    async fn preprocess(&self, source: ImageSource, max_dimension: u32) -> Result<PreparedImage> {
        tokio::task::spawn_blocking(move || prepare(source, max_dimension))
            .await
            .map_err(|e| Error::Preprocessing(format!("preprocessing task failed: {}", e)))?
    }
}

fn decode(source: &ImageSource) -> Result<DynamicImage> {
    match source {
        ImageSource::Path(path) => {
            if !path.is_file() {
                return Err(Error::Preprocessing(format!("{} does not exist", path.display())));
            }
            ImageReader::open(path)
                .and_then(|reader| reader.with_guessed_format())
                .map_err(|e| Error::Preprocessing(format!("cannot read {}: {}", path.display(), e)))?
                .decode()
                .map_err(|e| Error::Preprocessing(format!("cannot decode {}: {}", path.display(), e)))
        }
        ImageSource::Bytes(bytes) => image::load_from_memory(bytes)
            .map_err(|e| Error::Preprocessing(format!("cannot decode image bytes: {}", e))),
    }
}

fn prepare(source: ImageSource, max_dimension: u32) -> Result<PreparedImage> {
    let image = decode(&source)?;
    let (width, height) = image.dimensions();

    if width < MIN_DIMENSION || height < MIN_DIMENSION {
        return Err(Error::Preprocessing(format!(
            "image is {}x{}, minimum is {}x{}",
            width, height, MIN_DIMENSION, MIN_DIMENSION
        )));
    }

    let was_resized = max_dimension > 0 && width.max(height) > max_dimension;
    let image = if was_resized {
        image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| Error::Preprocessing(format!("cannot encode image: {}", e)))?;

    debug!(
        "Prepared {}x{} image ({} bytes{})",
        rgb.width(),
        rgb.height(),
        bytes.len(),
        if was_resized { ", resized" } else { "" }
    );

    Ok(PreparedImage {
        bytes,
        width: rgb.width(),
        height: rgb.height(),
        was_resized,
    })
}
