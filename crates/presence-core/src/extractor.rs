//! The embedding-extraction boundary.
//!
//! The rest of the system only sees [`EmbeddingExtractor`]: photo bytes in,
//! an [`Embedding`] or a typed failure out. [`OnnxExtractor`] is the
//! production implementation (SCRFD detection + ArcFace embedding).

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The image decoded fine but contained no usable face.
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("image is empty")]
    EmptyImage,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns a photograph into a face embedding.
///
/// Implementations must be deterministic for a fixed model configuration.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError>;

    /// Identifier of the embedding model; stored next to every enrolled vector.
    fn model_version(&self) -> &str;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError> {
        (**self).extract(image)
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }
}

/// SCRFD + ArcFace extractor running on ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models. Fails fast if either file is missing or invalid.
    pub fn load(detector_model: &Path, recognizer_model: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(detector_model)?;
        let recognizer = FaceRecognizer::load(recognizer_model)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError> {
        if image.is_empty() {
            return Err(ExtractError::EmptyImage);
        }
        let rgb = image::load_from_memory(image)?.to_rgb8();
        tracing::debug!(width = rgb.width(), height = rgb.height(), "decoded probe image");

        let face = self
            .detector
            .detect_best(&rgb)?
            .ok_or(ExtractError::NoFaceDetected)?;
        tracing::debug!(confidence = face.confidence, "face selected");

        Ok(self.recognizer.extract(&rgb, &face)?)
    }

    fn model_version(&self) -> &str {
        self.recognizer.model_version()
    }
}
