//! Identity matching against a gallery.
//!
//! Two interchangeable policies sit behind the [`Matcher`] trait:
//!
//! - [`DistanceMatcher`]: nearest reference embedding across the whole
//!   gallery, accepted only below a distance threshold.
//! - [`VerificationMatcher`]: asks the provider to verify the probe against
//!   each stored reference image and returns the first identity that
//!   verifies. Scores from different identities are not assumed comparable,
//!   so this is first-match, not best-match.

use crate::gallery::Gallery;
use crate::ingest;
use crate::provider::{detect_faces, EmbeddingProvider, FaceEncoding};
use crate::types::{Embedding, IdentityMatch};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default acceptance threshold for [`DistanceMetric::EuclideanL2`] over
/// 128-d FaceNet-style embeddings. Other models need their own value.
pub const DEFAULT_THRESHOLD: f32 = 0.48;

/// Margin added around each face when a multi-face probe is split up.
const PROBE_CROP_MARGIN: f32 = 0.2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Euclidean,
    /// Euclidean distance between L2-normalized vectors.
    #[default]
    EuclideanL2,
    /// `1 - cosine similarity`.
    Cosine,
}

impl DistanceMetric {
    /// Distance between two embeddings; infinite when dimensions differ, so
    /// embeddings from different models never match.
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        if a.dim() != b.dim() {
            return f32::INFINITY;
        }
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::EuclideanL2 => a.euclidean_l2_distance(b),
            DistanceMetric::Cosine => a.cosine_distance(b),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
            DistanceMetric::Cosine => "cosine",
        })
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric {other:?}")),
        }
    }
}

/// Which matching policy to run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchStrategy {
    Distance { metric: DistanceMetric, threshold: f32 },
    Verification,
}

impl Default for MatchStrategy {
    fn default() -> Self {
        MatchStrategy::Distance {
            metric: DistanceMetric::default(),
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// One face to identify.
pub struct Probe<'a> {
    /// Image region containing the face (the whole upload for single-face
    /// probes).
    pub image: &'a RgbImage,
    /// `None` when detection found nothing.
    pub face: Option<&'a FaceEncoding>,
}

/// Strategy for identifying a probe face against a gallery.
pub trait Matcher {
    fn identify(&self, probe: &Probe<'_>, gallery: &Gallery) -> IdentityMatch;
}

/// Global nearest-neighbour over every reference embedding.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub metric: DistanceMetric,
    pub threshold: f32,
}

impl DistanceMatcher {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Closest identity and its distance, regardless of threshold.
    ///
    /// Only a strictly smaller distance replaces the current best, so on
    /// exact ties the identity met first in gallery order wins.
    pub fn nearest<'g>(&self, probe: &Embedding, gallery: &'g Gallery) -> Option<(&'g str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for identity in gallery.matchable() {
            for reference in identity.reference_embeddings() {
                let distance = self.metric.distance(probe, reference);
                if best.map_or(distance.is_finite(), |(_, d)| distance < d) {
                    best = Some((identity.name.as_str(), distance));
                }
            }
        }
        best
    }

    /// Identify a bare embedding. The returned match carries no bounding box.
    pub fn compare(&self, probe: &Embedding, gallery: &Gallery) -> IdentityMatch {
        match self.nearest(probe, gallery) {
            Some((name, distance)) if distance < self.threshold => {
                tracing::debug!(name, distance, threshold = self.threshold, "distance match");
                IdentityMatch {
                    name: name.to_string(),
                    confidence: Some(distance),
                    bbox: None,
                }
            }
            nearest => {
                tracing::debug!(
                    nearest = ?nearest,
                    threshold = self.threshold,
                    "no identity within threshold"
                );
                IdentityMatch::unknown(None)
            }
        }
    }
}

impl Matcher for DistanceMatcher {
    fn identify(&self, probe: &Probe<'_>, gallery: &Gallery) -> IdentityMatch {
        let Some(face) = probe.face else {
            return IdentityMatch::unknown(None);
        };
        IdentityMatch {
            bbox: Some(face.bbox),
            ..self.compare(&face.embedding, gallery)
        }
    }
}

/// First-verified scan over stored reference images.
pub struct VerificationMatcher<'p, P: ?Sized> {
    provider: &'p P,
}

impl<'p, P: EmbeddingProvider + ?Sized> VerificationMatcher<'p, P> {
    pub fn new(provider: &'p P) -> Self {
        Self { provider }
    }
}

impl<P: EmbeddingProvider + ?Sized> Matcher for VerificationMatcher<'_, P> {
    fn identify(&self, probe: &Probe<'_>, gallery: &Gallery) -> IdentityMatch {
        let bbox = probe.face.map(|f| f.bbox);

        for identity in gallery.matchable() {
            for reference in &identity.references {
                let Some(path) = &reference.image else {
                    continue;
                };
                let reference_image = match ingest::open_image(path) {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::debug!(name = %identity.name, path = %path.display(), error = %e, "reference image unreadable; skipped");
                        continue;
                    }
                };

                match self.provider.verify(probe.image, &reference_image) {
                    Ok(v) if v.verified => {
                        tracing::debug!(name = %identity.name, distance = v.distance, "verified");
                        return IdentityMatch {
                            name: identity.name.clone(),
                            confidence: Some(v.distance),
                            bbox,
                        };
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(name = %identity.name, error = %e, "verification failed; treated as no match");
                    }
                }
            }
        }

        IdentityMatch::unknown(bbox)
    }
}

/// Build the matcher selected by `strategy`.
pub fn build_matcher<'p, P: EmbeddingProvider + ?Sized>(
    strategy: MatchStrategy,
    provider: &'p P,
) -> Box<dyn Matcher + 'p> {
    match strategy {
        MatchStrategy::Distance { metric, threshold } => {
            Box::new(DistanceMatcher::new(metric, threshold))
        }
        MatchStrategy::Verification => Box::new(VerificationMatcher::new(provider)),
    }
}

/// Identify every face in `image`, one match per detected face in
/// detection order.
///
/// Never fails: a probe without a detectable face (or a provider failure
/// during detection) yields a single match with no bounding box, which the
/// distance policy reports as unknown and the verification policy still
/// tries against the whole image.
pub fn identify_faces<P: EmbeddingProvider + ?Sized>(
    matcher: &dyn Matcher,
    provider: &P,
    image: &RgbImage,
    gallery: &Gallery,
) -> Vec<IdentityMatch> {
    let faces = match detect_faces(provider, image) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::debug!(error = %e, "probe detection failed; treating as no detection");
            Vec::new()
        }
    };
    tracing::debug!(faces = faces.len(), "probe faces detected");

    match faces.as_slice() {
        [] => vec![matcher.identify(&Probe { image, face: None }, gallery)],
        [face] => vec![matcher.identify(&Probe { image, face: Some(face) }, gallery)],
        _ => faces
            .iter()
            .map(|face| {
                let crop = ingest::crop_face(image, &face.bbox, PROBE_CROP_MARGIN);
                let region = crop.as_ref().unwrap_or(image);
                matcher.identify(&Probe { image: region, face: Some(face) }, gallery)
            })
            .collect(),
    }
}
