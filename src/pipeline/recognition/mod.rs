//! Recognition backends and the ensemble that chooses among them.
//!
//! The core only consumes the backend contract: text plus a confidence in
//! `[0, 1]`. Backends are a fixed set built from configuration.

pub mod ensemble;
pub mod gate;
pub mod mock;
pub mod tesseract;
pub mod vision;

use std::io::Cursor;

use image::ImageOutputFormat;
use thiserror::Error;

use crate::config::{BackendConfig, ConfigError};
use crate::pipeline::collaborators::PageImage;

pub use ensemble::{EnsembleCoordinator, PageRecognition};
pub use gate::{GatedBackend, PermitGate};

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Backend {0} is unreachable")]
    Unreachable(String),

    #[error("Backend {backend} timed out after {secs}s")]
    Timeout { backend: String, secs: u64 },

    #[error("Page image encoding failed: {0}")]
    Encode(String),
}

/// Raw output of one backend for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOutput {
    pub text: String,
    pub confidence: f32,
}

/// Capability every recognition engine exposes.
pub trait RecognitionBackend: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, page: &PageImage) -> Result<RecognitionOutput, RecognitionError>;
}

/// Shared backends, so a caller can keep a handle after boxing one.
impl<T: RecognitionBackend> RecognitionBackend for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, page: &PageImage) -> Result<RecognitionOutput, RecognitionError> {
        (**self).run(page)
    }
}

/// Clamp a backend score into `[0, 1]`; NaN counts as no confidence.
pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Encode a grayscale page as PNG, the format both engines accept.
pub fn encode_png(page: &PageImage) -> Result<Vec<u8>, RecognitionError> {
    let gray = image::GrayImage::from_raw(page.width, page.height, page.pixels.clone())
        .ok_or_else(|| {
            RecognitionError::Encode(format!(
                "page {} has {} bytes for {}x{}",
                page.index,
                page.pixels.len(),
                page.width,
                page.height
            ))
        })?;
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(gray)
        .write_to(&mut buf, ImageOutputFormat::Png)
        .map_err(|e| RecognitionError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

/// Build the backend a config entry names.
pub fn build_backend(config: &BackendConfig) -> Result<Box<dyn RecognitionBackend>, ConfigError> {
    match config {
        BackendConfig::Tesseract { binary, language, .. } => Ok(Box::new(
            tesseract::TesseractCli::new(binary, language)?,
        )),
        BackendConfig::OllamaVision { endpoint, model, timeout_secs, .. } => Ok(Box::new(
            vision::OllamaVision::new(endpoint, model, *timeout_secs)?,
        )),
    }
}
