//! ONNX Runtime embedding provider: SCRFD detection + ArcFace recognition.
//!
//! Both models come from the insightface `buffalo_l` pack and are expected
//! in one model directory under their upstream file names.

mod alignment;
mod detector;
mod recognizer;

pub use detector::FaceDetector;
pub use recognizer::FaceRecognizer;

use crate::matcher::DistanceMetric;
use crate::provider::{EmbeddingProvider, FaceEncoding, ProviderError, Verification};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

/// Cosine distance at or below which two ArcFace faces verify as the same
/// person.
pub const DEFAULT_VERIFY_THRESHOLD: f32 = 0.68;

/// Distance-strategy threshold for w600k_r50 embeddings under `metric`.
///
/// All three values correspond to a cosine similarity of 0.40. The
/// embeddings are unit length, so plain Euclidean equals the L2 form.
pub fn default_distance_threshold(metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Cosine => 0.60,
        DistanceMetric::Euclidean | DistanceMetric::EuclideanL2 => 1.10,
    }
}

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}; download it from insightface and place it in the model directory")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<OnnxError> for ProviderError {
    fn from(e: OnnxError) -> Self {
        match e {
            OnnxError::InvalidInput(reason) => ProviderError::InvalidInput(reason),
            other => ProviderError::Inference(other.to_string()),
        }
    }
}

/// `models` under [`crate::default_data_dir`].
pub fn default_model_dir() -> PathBuf {
    crate::default_data_dir().join("models")
}

/// [`EmbeddingProvider`] backed by ONNX Runtime sessions.
///
/// Sessions need exclusive access to run, so each model sits behind its own
/// mutex; calls from one thread never contend.
pub struct OnnxProvider {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
    verify_threshold: f32,
}

impl OnnxProvider {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path, verify_threshold: f32) -> Result<Self, OnnxError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            verify_threshold,
        })
    }

    fn most_confident_face(&self, image: &RgbImage) -> Result<FaceEncoding, ProviderError> {
        self.detect_and_encode(image)?
            .into_iter()
            .next()
            .ok_or(ProviderError::NoFaceDetected)
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<FaceEncoding>, ProviderError> {
        let boxes = self
            .detector
            .lock()
            .map_err(|_| ProviderError::Inference("detector lock poisoned".into()))?
            .detect(image)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| ProviderError::Inference("recognizer lock poisoned".into()))?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = recognizer.embed(image, &bbox)?;
            faces.push(FaceEncoding { bbox, embedding });
        }
        tracing::debug!(faces = faces.len(), "faces encoded");
        Ok(faces)
    }

    fn verify(&self, a: &RgbImage, b: &RgbImage) -> Result<Verification, ProviderError> {
        let first = self.most_confident_face(a)?;
        let second = self.most_confident_face(b)?;
        let distance = first.embedding.cosine_distance(&second.embedding);
        Ok(Verification {
            verified: distance <= self.verify_threshold,
            distance,
        })
    }
}
