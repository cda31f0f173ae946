use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name reported (and recorded) when no registered identity matches a probe.
pub const UNKNOWN: &str = "Unknown";

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 for degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer `(x, y, width, height)` rectangle clipped to an image of the
    /// given size. `None` when nothing of the box lies inside the image.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.floor().clamp(0.0, width as f32) as u32;
        let y0 = self.y.floor().clamp(0.0, height as f32) as u32;
        let x1 = (self.x + self.width).ceil().clamp(0.0, width as f32) as u32;
        let y1 = (self.y + self.height).ceil().clamp(0.0, height as f32) as u32;

        if x1 > x0 && y1 > y0 {
            Some((x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }
}

/// Face embedding vector (128-d for FaceNet-style models, 512-d for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// `1 - similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Euclidean distance after L2-normalizing both vectors, in [0, 2].
    pub fn euclidean_l2_distance(&self, other: &Embedding) -> f32 {
        self.normalized().euclidean_distance(&other.normalized())
    }

    /// Copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// One registered photo of an identity: its derived embedding plus the
/// retained source image.
#[derive(Debug, Clone)]
pub struct Reference {
    /// Content hash of the source pixels.
    pub id: String,
    pub embedding: Embedding,
    /// Stored source image; `None` for references that only live in memory.
    pub image: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// A named registrant and every reference registered under that name.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub references: Vec<Reference>,
}

impl Identity {
    pub fn reference_embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.references.iter().map(|r| &r.embedding)
    }

    /// An identity without references never takes part in matching.
    pub fn is_matchable(&self) -> bool {
        !self.references.is_empty()
    }
}

/// Outcome of identifying one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityMatch {
    /// Registered name, or [`UNKNOWN`].
    pub name: String,
    /// Distance of the accepted reference; `None` for unknown faces.
    pub confidence: Option<f32>,
    /// Face this match refers to; `None` when the probe had no detected face.
    pub bbox: Option<BoundingBox>,
}

impl IdentityMatch {
    pub fn unknown(bbox: Option<BoundingBox>) -> Self {
        Self {
            name: UNKNOWN.to_string(),
            confidence: None,
            bbox,
        }
    }

    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN
    }
}

/// One row of the attendance ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub time: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.cosine_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        let a = emb(&[1.0, 0.0]);
        assert!(a.similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
        assert!((a.similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let d = emb(&[0.0, 0.0]).euclidean_distance(&emb(&[3.0, 4.0]));
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let a = emb(&[2.0, 0.0]);
        let b = emb(&[10.0, 0.0]);
        assert!(a.euclidean_l2_distance(&b).abs() < 1e-6);

        // Orthogonal unit vectors are sqrt(2) apart.
        let c = emb(&[0.0, 3.0]);
        assert!((a.euclidean_l2_distance(&c) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_keeps_zero_vector() {
        let z = emb(&[0.0, 0.0]).normalized();
        assert_eq!(z.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&bbox(20.0, 20.0, 5.0, 5.0)), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_to_image() {
        let b = bbox(-5.0, 2.5, 20.0, 4.0);
        assert_eq!(b.clip_to(10, 10), Some((0, 2, 10, 5)));
        assert_eq!(bbox(50.0, 50.0, 5.0, 5.0).clip_to(10, 10), None);
    }

    #[test]
    fn test_unknown_match() {
        let m = IdentityMatch::unknown(None);
        assert_eq!(m.name, UNKNOWN);
        assert!(!m.is_known());
    }
}
