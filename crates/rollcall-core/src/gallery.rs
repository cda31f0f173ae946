//! Gallery store: registered identities on disk, one directory per name.
//!
//! ```text
//! <root>/<name>/<reference-id>.png    retained source image
//! <root>/<name>/<reference-id>.json   embedding record
//! ```
//!
//! Every file is written under a hidden temporary name and renamed into
//! place. The JSON record is written last, so a reference only becomes
//! visible to `load_all` once both of its files are complete.

use crate::provider::{detect_faces, EmbeddingProvider};
use crate::types::{Embedding, Identity, Reference, UNKNOWN};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("registration needs a non-blank name and at least one image with a detectable face")]
    EmptyRegistration,
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("failed to write {path}: {source}")]
    StorageWriteFailure { path: PathBuf, source: io::Error },
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery at {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

/// Every registered identity, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identities(mut identities: Vec<Identity>) -> Self {
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Self { identities }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Identities that can take part in matching, in gallery order.
    pub fn matchable(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter().filter(|i| i.is_matchable())
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.position(name).ok().map(|idx| &self.identities[idx])
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Append references to `name`, creating the identity if needed.
    /// References whose id is already present are ignored. Returns the
    /// number actually added.
    pub fn append(&mut self, name: &str, references: Vec<Reference>) -> usize {
        let idx = match self.position(name) {
            Ok(idx) => idx,
            Err(idx) => {
                self.identities.insert(
                    idx,
                    Identity {
                        name: name.to_string(),
                        references: Vec::new(),
                    },
                );
                idx
            }
        };

        let identity = &mut self.identities[idx];
        let mut added = 0;
        for reference in references {
            if identity.references.iter().all(|r| r.id != reference.id) {
                identity.references.push(reference);
                added += 1;
            }
        }
        added
    }

    fn position(&self, name: &str) -> Result<usize, usize> {
        self.identities
            .binary_search_by(|identity| identity.name.as_str().cmp(name))
    }
}

/// Summary of one `register` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registration {
    /// New references written.
    pub added: usize,
    /// Images whose exact pixels were already registered under this name.
    pub already_present: usize,
    /// Images discarded because no face was found or the provider failed.
    pub skipped: usize,
}

/// On-disk form of a [`Reference`].
#[derive(Debug, Serialize, Deserialize)]
struct ReferenceRecord {
    id: String,
    embedding: Embedding,
    /// Source image file name, relative to the identity directory.
    image: String,
    created_at: DateTime<Utc>,
}

/// Directory-backed gallery.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    root: PathBuf,
}

impl GalleryStore {
    /// Use `root` as the gallery directory. Nothing is touched until the
    /// first registration.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register `images` under `name`, appending to any existing references.
    ///
    /// Faceless images are discarded; for images with several faces the
    /// first (most confident) one is used. On success the new references are
    /// also appended to `gallery`, so a caller holding a loaded gallery does
    /// not need to reload it.
    pub fn register<P: EmbeddingProvider + ?Sized>(
        &self,
        provider: &P,
        gallery: &mut Gallery,
        name: &str,
        images: &[RgbImage],
    ) -> Result<Registration, RegistrationError> {
        let name = validate_name(name)?;

        let mut report = Registration::default();
        let mut usable = Vec::new();
        for (index, image) in images.iter().enumerate() {
            match detect_faces(provider, image) {
                Ok(faces) => match faces.into_iter().next() {
                    Some(face) => usable.push((image, face.embedding)),
                    None => {
                        tracing::debug!(name, index, "registration image has no face; skipped");
                        report.skipped += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!(name, index, error = %e, "provider failed on registration image; skipped");
                    report.skipped += 1;
                }
            }
        }

        if usable.is_empty() {
            return Err(RegistrationError::EmptyRegistration);
        }

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(|source| RegistrationError::StorageWriteFailure {
            path: dir.clone(),
            source,
        })?;

        let mut references = Vec::with_capacity(usable.len());
        for (image, embedding) in usable {
            let id = content_id(image);
            let record_path = dir.join(format!("{id}.json"));
            if record_path.exists() {
                report.already_present += 1;
                continue;
            }

            let image_name = format!("{id}.png");
            let image_path = dir.join(&image_name);
            write_atomic(&image_path, &encode_png(image)?)?;

            let record = ReferenceRecord {
                id: id.clone(),
                embedding,
                image: image_name,
                created_at: Utc::now(),
            };
            let json = serde_json::to_vec_pretty(&record).map_err(|e| {
                RegistrationError::StorageWriteFailure {
                    path: record_path.clone(),
                    source: io::Error::other(e),
                }
            })?;
            write_atomic(&record_path, &json)?;

            references.push(Reference {
                id,
                embedding: record.embedding,
                image: Some(image_path),
                created_at: record.created_at,
            });
            report.added += 1;
        }

        gallery.append(name, references);
        tracing::info!(
            name,
            added = report.added,
            already_present = report.already_present,
            skipped = report.skipped,
            "identity registered"
        );
        Ok(report)
    }

    /// Load every identity with at least one readable reference.
    ///
    /// A missing root is an empty gallery. Unreadable or unparseable
    /// reference records are skipped with a warning.
    pub fn load_all(&self) -> Result<Gallery, GalleryError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Gallery::new()),
            Err(source) => {
                return Err(GalleryError::Read {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| GalleryError::Read {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!(path = %path.display(), "identity directory name is not UTF-8; skipped");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let references = load_references(&path)?;
            if references.is_empty() {
                tracing::debug!(name, "identity has no references; not matchable");
                continue;
            }
            identities.push(Identity { name, references });
        }

        let gallery = Gallery::from_identities(identities);
        tracing::debug!(identities = gallery.len(), root = %self.root.display(), "gallery loaded");
        Ok(gallery)
    }
}

fn load_references(dir: &Path) -> Result<Vec<Reference>, GalleryError> {
    let read_err = |source| GalleryError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut references = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        let is_record = path.extension().is_some_and(|ext| ext == "json");
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if !is_record || hidden {
            continue;
        }

        let record = match fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<ReferenceRecord>(&bytes).map_err(|e| e.to_string())
            }) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "unreadable reference record; skipped");
                continue;
            }
        };

        references.push(Reference {
            id: record.id,
            embedding: record.embedding,
            image: Some(dir.join(record.image)),
            created_at: record.created_at,
        });
    }

    references.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(references)
}

/// Trimmed name, or why it cannot be used as a storage namespace.
fn validate_name(raw: &str) -> Result<&str, RegistrationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(RegistrationError::EmptyRegistration);
    }
    let unsafe_char = name
        .chars()
        .any(|c| matches!(c, '/' | '\\') || c.is_control());
    if name == UNKNOWN || name.starts_with('.') || unsafe_char {
        return Err(RegistrationError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// SHA-256 over dimensions and pixels, first 16 bytes as hex.
fn content_id(image: &RgbImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_raw());
    hasher.finalize()[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, RegistrationError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| RegistrationError::StorageWriteFailure {
            path: PathBuf::from("<png encoder>"),
            source: io::Error::other(e),
        })?;
    Ok(out.into_inner())
}

/// Write to a hidden sibling, sync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RegistrationError> {
    let failure = |source| RegistrationError::StorageWriteFailure {
        path: path.to_path_buf(),
        source,
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(failure(e));
    }
    Ok(())
}
