//! Deterministic provider for tests.
//!
//! Images are rows of `TILE`×`TILE` coloured tiles. Every non-black tile is
//! one face whose embedding is its colour scaled to [0, 1]. Tiles are read
//! at their centre pixel, so a crop that bleeds into a neighbour still sees
//! its own face.

use crate::provider::{EmbeddingProvider, FaceEncoding, ProviderError, Verification};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const TILE: u32 = 4;

const BLACK: [u8; 3] = [0, 0, 0];

fn tile_color(image: &RgbImage, index: u32) -> [u8; 3] {
    image.get_pixel(index * TILE + TILE / 2, TILE / 2).0
}

pub fn tiles(colors: &[[u8; 3]]) -> RgbImage {
    let width = (colors.len() as u32).max(1) * TILE;
    RgbImage::from_fn(width, TILE, |x, _| {
        Rgb(colors.get((x / TILE) as usize).copied().unwrap_or(BLACK))
    })
}

pub fn face(color: [u8; 3]) -> RgbImage {
    tiles(&[color])
}

pub fn blank() -> RgbImage {
    tiles(&[BLACK])
}

pub fn embedding_for(color: [u8; 3]) -> Embedding {
    Embedding::new(color.iter().map(|&c| c as f32 / 255.0).collect())
}

#[derive(Default)]
pub struct FakeProvider {
    pub verify_calls: AtomicUsize,
    /// Reference colours whose verification raises an inference error.
    pub failing: Vec<[u8; 3]>,
    pub fail_detection: bool,
}

impl FakeProvider {
    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for FakeProvider {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<FaceEncoding>, ProviderError> {
        if self.fail_detection {
            return Err(ProviderError::Inference("fake detector offline".into()));
        }

        if image.height() < TILE {
            return Err(ProviderError::NoFaceDetected);
        }

        let faces: Vec<FaceEncoding> = (0..image.width() / TILE)
            .filter_map(|i| {
                let color = tile_color(image, i);
                (color != BLACK).then(|| FaceEncoding {
                    bbox: BoundingBox {
                        x: (i * TILE) as f32,
                        y: 0.0,
                        width: TILE as f32,
                        height: TILE as f32,
                        confidence: 0.9,
                        landmarks: None,
                    },
                    embedding: embedding_for(color),
                })
            })
            .collect();

        if faces.is_empty() {
            return Err(ProviderError::NoFaceDetected);
        }
        Ok(faces)
    }

    fn verify(&self, a: &RgbImage, b: &RgbImage) -> Result<Verification, ProviderError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);

        let probe = self.detect_and_encode(a)?;
        let reference = self.detect_and_encode(b)?;
        if self
            .failing
            .iter()
            .any(|&color| embedding_for(color) == reference[0].embedding)
        {
            return Err(ProviderError::Inference("fake verification failure".into()));
        }

        let distance = probe[0].embedding.euclidean_distance(&reference[0].embedding);
        Ok(Verification {
            verified: distance < 1e-6,
            distance,
        })
    }
}
