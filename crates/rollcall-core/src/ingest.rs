//! Image ingestion: encoded uploads to RGB pixel grids, face crops.

use crate::types::BoundingBox;
use image::{imageops, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("empty image upload")]
    Empty,
    #[error("unsupported or corrupt image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    ZeroSize,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Decode JPEG/PNG (or any format the `image` crate recognises) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Empty);
    }
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(IngestError::ZeroSize);
    }
    Ok(rgb)
}

pub fn open_image(path: &Path) -> Result<RgbImage, IngestError> {
    let bytes = std::fs::read(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_image(&bytes)
}

/// Cut a face out of `image`, growing the box by `margin` (a fraction of its
/// size) on every side. `None` if the box misses the image entirely.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox, margin: f32) -> Option<RgbImage> {
    let grown = BoundingBox {
        x: bbox.x - bbox.width * margin,
        y: bbox.y - bbox.height * margin,
        width: bbox.width * (1.0 + 2.0 * margin),
        height: bbox.height * (1.0 + 2.0 * margin),
        ..*bbox
    };
    let (x, y, w, h) = grown.clip_to(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}
