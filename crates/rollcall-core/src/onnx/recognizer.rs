//! ArcFace recognizer: 512-d embeddings from face crops.
//!
//! Faces with detected landmarks are warped onto the canonical five-point
//! template. Faces without them are cut out with a small margin and resized
//! to 112×112.

use super::alignment;
use super::OnnxError;
use crate::ingest;
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
const STD: f32 = 127.5; // symmetric, unlike SCRFD
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";
const CROP_MARGIN: f32 = 0.1;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace recognizer");
        Ok(Self { session })
    }

    /// L2-normalized embedding of the face inside `bbox`.
    pub fn embed(&mut self, image: &RgbImage, bbox: &BoundingBox) -> Result<Embedding, OnnxError> {
        let crop = face_crop(image, bbox)
            .ok_or_else(|| OnnxError::InvalidInput("face box lies outside the image".into()))?;
        let input = to_tensor(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(OnnxError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(MODEL_VERSION.to_string()),
        }
        .normalized())
    }
}

/// 112×112 model input for the face in `bbox`, or `None` when it misses the
/// image.
fn face_crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    if let Some(aligned) = bbox
        .landmarks
        .and_then(|landmarks| alignment::align_face(image, &landmarks))
    {
        return Some(aligned);
    }

    let crop = ingest::crop_face(image, bbox, CROP_MARGIN)?;
    Some(imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

fn to_tensor(face: &RgbImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (value as f32 - MEAN) / STD;
        }
    }
    tensor
}
