//! SCRFD face detector over RGB images.
//!
//! The image is scaled to fit a 640×640 canvas anchored top-left, scored at
//! strides 8/16/32 (two anchors per cell), and overlapping boxes are merged
//! with non-maximum suppression. Models that export `kps_*` outputs also
//! yield five facial landmarks per face for alignment.

use super::OnnxError;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Output tensor indices for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutput {
    scores: usize,
    boxes: usize,
    keypoints: Option<usize>,
}

type StrideOutputs = [StrideOutput; 3];

pub struct FaceDetector {
    session: Session,
    outputs: StrideOutputs,
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 6 {
            return Err(OnnxError::InferenceFailed(format!(
                "SCRFD model needs score and box outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let outputs = stride_outputs(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD detector");

        Ok(Self { session, outputs })
    }

    /// Faces in `image`, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, OnnxError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(OnnxError::InvalidInput("image has zero size".into()));
        }

        let scale = fit_scale(image.width(), image.height());
        let input = to_tensor(image, scale);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, output) in STRIDES.iter().zip(self.outputs.iter()) {
            let (_, scores) = outputs[output.scores]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::InferenceFailed(format!("scores at stride {stride}: {e}")))?;
            let (_, boxes) = outputs[output.boxes]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::InferenceFailed(format!("boxes at stride {stride}: {e}")))?;
            let keypoints = match output.keypoints {
                Some(idx) => Some(
                    outputs[idx]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| OnnxError::InferenceFailed(format!("kps at stride {stride}: {e}")))?
                        .1,
                ),
                None => None,
            };
            candidates.extend(decode_stride(
                &StrideTensors { scores, boxes, keypoints },
                stride,
                scale,
                SCORE_THRESHOLD,
            ));
        }

        let faces = non_max_suppression(candidates, NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

/// Scale that fits `width`×`height` inside the square input.
fn fit_scale(width: u32, height: u32) -> f32 {
    (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32)
}

/// NCHW tensor of the scaled image in the top-left corner. Padding stays
/// zero, which is the normalized value of a mid-grey pixel.
fn to_tensor(image: &RgbImage, scale: f32) -> Array4<f32> {
    let width = ((image.width() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let height = ((image.height() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(image, width, height, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (value as f32 - MEAN) / STD;
        }
    }
    tensor
}

/// Map outputs to strides by name (`score_8`, `bbox_8`, `kps_8`, ...),
/// falling back to the stock export order: scores for strides 8/16/32, then
/// boxes, then keypoints when the model has them.
fn stride_outputs(names: &[String]) -> StrideOutputs {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutput>> = STRIDES
        .iter()
        .map(|&s| {
            Some(StrideOutput {
                scores: find("score", s)?,
                boxes: find("bbox", s)?,
                keypoints: find("kps", s),
            })
        })
        .collect();

    if let Some(found) = named {
        return [found[0], found[1], found[2]];
    }

    let has_keypoints = names.len() >= 9;
    [0, 1, 2].map(|i| StrideOutput {
        scores: i,
        boxes: i + 3,
        keypoints: has_keypoints.then_some(i + 6),
    })
}

/// Raw output slices for one stride.
struct StrideTensors<'a> {
    scores: &'a [f32],
    /// Four distances per anchor: left, top, right, bottom.
    boxes: &'a [f32],
    /// Ten offsets per anchor: `(x, y)` for each of the five landmarks.
    keypoints: Option<&'a [f32]>,
}

/// Boxes above `threshold` for one stride, in source-image coordinates.
fn decode_stride(
    tensors: &StrideTensors<'_>,
    stride: usize,
    scale: f32,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    tensors
        .scores
        .iter()
        .take(cells * cells * ANCHORS_PER_CELL)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let offsets = tensors.boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % cells) as f32 * step;
            let cy = (cell / cells) as f32 * step;

            let x1 = (cx - offsets[0] * step) / scale;
            let y1 = (cy - offsets[1] * step) / scale;
            let x2 = (cx + offsets[2] * step) / scale;
            let y2 = (cy + offsets[3] * step) / scale;

            let landmarks = tensors
                .keypoints
                .and_then(|kps| kps.get(idx * 10..idx * 10 + 10))
                .map(|kps| {
                    let mut points = [(0.0f32, 0.0f32); 5];
                    for (point, xy) in points.iter_mut().zip(kps.chunks_exact(2)) {
                        *point = ((cx + xy[0] * step) / scale, (cy + xy[1] * step) / scale);
                    }
                    points
                });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Keep the most confident box of every overlapping cluster.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
