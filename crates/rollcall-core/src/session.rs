//! Interaction-level orchestration: register, identify, mark attendance.
//!
//! Each call runs to completion on the caller's thread. The gallery is an
//! explicit value owned by the caller; load it with [`AttendanceSession::load_gallery`]
//! and keep it for as long as staleness is acceptable.

use crate::gallery::{Gallery, GalleryError, GalleryStore, Registration, RegistrationError};
use crate::ledger::{AttendanceLedger, LedgerError, RecordOutcome};
use crate::matcher::{build_matcher, identify_faces, MatchStrategy};
use crate::provider::EmbeddingProvider;
use crate::types::IdentityMatch;
use chrono::NaiveDateTime;
use image::RgbImage;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub strategy: MatchStrategy,
    /// Write a ledger row for faces nobody matched.
    pub record_unknown: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strategy: MatchStrategy::default(),
            record_unknown: true,
        }
    }
}

/// Result of marking attendance for one face.
///
/// Identification and recording are reported separately: a face can be
/// identified while its ledger write fails.
#[derive(Debug)]
pub struct MarkOutcome {
    pub identity: IdentityMatch,
    /// `None` when no write was attempted.
    pub recorded: Option<Result<RecordOutcome, LedgerError>>,
}

pub struct AttendanceSession<P> {
    provider: P,
    store: GalleryStore,
    ledger: AttendanceLedger,
    config: SessionConfig,
}

impl<P: EmbeddingProvider> AttendanceSession<P> {
    pub fn new(
        provider: P,
        store: GalleryStore,
        ledger: AttendanceLedger,
        config: SessionConfig,
    ) -> Self {
        Self {
            provider,
            store,
            ledger,
            config,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn store(&self) -> &GalleryStore {
        &self.store
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn load_gallery(&self) -> Result<Gallery, GalleryError> {
        self.store.load_all()
    }

    pub fn register(
        &self,
        gallery: &mut Gallery,
        name: &str,
        images: &[RgbImage],
    ) -> Result<Registration, RegistrationError> {
        self.store.register(&self.provider, gallery, name, images)
    }

    /// One match per detected face (a single unknown match when none).
    pub fn identify(&self, gallery: &Gallery, image: &RgbImage) -> Vec<IdentityMatch> {
        let matcher = build_matcher(self.config.strategy, &self.provider);
        identify_faces(matcher.as_ref(), &self.provider, image, gallery)
    }

    /// Identify every face in `image` and append one ledger row per face.
    pub fn mark_attendance(
        &self,
        gallery: &Gallery,
        image: &RgbImage,
        at: NaiveDateTime,
    ) -> Vec<MarkOutcome> {
        self.identify(gallery, image)
            .into_iter()
            .map(|identity| {
                if !identity.is_known() && !self.config.record_unknown {
                    tracing::debug!("unknown face not recorded");
                    return MarkOutcome {
                        identity,
                        recorded: None,
                    };
                }

                let recorded = self.ledger.record(&identity.name, at);
                if let Err(e) = &recorded {
                    tracing::warn!(name = %identity.name, error = %e, "identified but attendance not recorded");
                }
                MarkOutcome {
                    identity,
                    recorded: Some(recorded),
                }
            })
            .collect()
    }
}
