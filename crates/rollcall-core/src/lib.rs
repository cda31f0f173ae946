//! rollcall-core: Face gallery, identity matching and attendance ledger.
//!
//! Photos are turned into face embeddings by an [`EmbeddingProvider`],
//! matched against registered identities, and successful identifications
//! are appended to a CSV attendance ledger. The `onnx` feature supplies a
//! provider built on SCRFD detection and ArcFace recognition.

pub mod gallery;
pub mod ingest;
pub mod ledger;
pub mod matcher;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod provider;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

pub use gallery::{Gallery, GalleryStore, Registration};
pub use ledger::{AttendanceLedger, RecordOutcome};
pub use matcher::{DistanceMatcher, DistanceMetric, MatchStrategy, Matcher, VerificationMatcher};
pub use provider::{EmbeddingProvider, FaceEncoding, ProviderError, Verification};
pub use session::{AttendanceSession, MarkOutcome, SessionConfig};
pub use types::{AttendanceRecord, BoundingBox, Embedding, Identity, IdentityMatch, Reference, UNKNOWN};

use std::path::PathBuf;

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
