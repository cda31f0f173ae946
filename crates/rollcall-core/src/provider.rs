//! Embedding provider capability: face detection, embedding and pairwise
//! verification, supplied by an external model backend.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("invalid input image: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One detected face together with its embedding.
#[derive(Debug, Clone)]
pub struct FaceEncoding {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Result of comparing two images face-to-face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub verified: bool,
    pub distance: f32,
}

/// Model backend used for registration and identification.
pub trait EmbeddingProvider {
    /// Detect every face in `image`, most confident first, and embed each one.
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<FaceEncoding>, ProviderError>;

    /// Decide whether `a` and `b` show the same person.
    fn verify(&self, a: &RgbImage, b: &RgbImage) -> Result<Verification, ProviderError>;
}

/// Run detection, mapping `NoFaceDetected` to an empty result.
///
/// A faceless image is an ordinary outcome; only other provider failures
/// are returned as errors.
pub fn detect_faces<P: EmbeddingProvider + ?Sized>(
    provider: &P,
    image: &RgbImage,
) -> Result<Vec<FaceEncoding>, ProviderError> {
    match provider.detect_and_encode(image) {
        Err(ProviderError::NoFaceDetected) => Ok(Vec::new()),
        other => other,
    }
}
