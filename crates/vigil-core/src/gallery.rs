//! The shared set of enrolled identities.
//!
//! Reads take a cheap `Arc` snapshot under a read lock and match without
//! holding it; enrollment copies-on-append under the write lock. A matcher
//! therefore always sees a complete, immutable list of entries.

use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::matcher::{MatchResult, Matcher};
use crate::types::{Embedding, FaceObservation};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("no face found in the image")]
    NoFace,
    #[error("multiple faces found ({0}); use an image with only one face")]
    AmbiguousFace(usize),
    #[error("invalid embedding dimension: {got} (expected {expected})")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbedding,
}

/// One enrolled face.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: Uuid,
    pub name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

impl GalleryEntry {
    pub fn new(name: &str, embedding: Embedding) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            embedding,
            enrolled_at: Utc::now(),
        }
    }
}

/// Append-only, concurrently readable gallery with a fixed embedding dimension.
#[derive(Debug)]
pub struct Gallery {
    dim: usize,
    entries: RwLock<Arc<Vec<GalleryEntry>>>,
}

impl Gallery {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Build a gallery from previously persisted entries, validating each.
    pub fn from_entries(dim: usize, entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let gallery = Self::new(dim);
        for entry in &entries {
            gallery.validate(&entry.embedding)?;
        }
        *gallery.write_lock() = Arc::new(entries);
        Ok(gallery)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Immutable view of the current entries, in enrollment order.
    pub fn snapshot(&self) -> Arc<Vec<GalleryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Check an embedding is acceptable for this gallery.
    pub fn validate(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.dim() != self.dim {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dim,
                got: embedding.dim(),
            });
        }
        if !embedding.is_finite() {
            return Err(GalleryError::InvalidEmbedding);
        }
        Ok(())
    }

    /// Pick the single face an enrollment image must contain.
    pub fn enrollment_face(
        observations: &[FaceObservation],
    ) -> Result<&FaceObservation, GalleryError> {
        match observations {
            [] => Err(GalleryError::NoFace),
            [face] => Ok(face),
            many => Err(GalleryError::AmbiguousFace(many.len())),
        }
    }

    /// Append a validated entry. Names are not deduplicated.
    pub fn insert(&self, entry: GalleryEntry) -> Result<(), GalleryError> {
        self.validate(&entry.embedding)?;
        let mut guard = self.write_lock();
        Arc::make_mut(&mut *guard).push(entry);
        Ok(())
    }

    /// Enroll `name` from the faces detected in one source image.
    ///
    /// Rejects images with zero or several faces before anything is appended.
    pub fn enroll(
        &self,
        name: &str,
        observations: &[FaceObservation],
    ) -> Result<GalleryEntry, GalleryError> {
        let face = Self::enrollment_face(observations)?;
        let entry = GalleryEntry::new(name, face.embedding.clone());
        self.insert(entry.clone())?;
        tracing::info!(name, entry_id = %entry.id, "gallery: identity enrolled");
        Ok(entry)
    }

    /// Match a probe against the current snapshot.
    ///
    /// A probe of the wrong dimension cannot match any entry and is reported
    /// unknown without scanning.
    pub fn match_embedding<M: Matcher>(&self, matcher: &M, probe: &Embedding) -> MatchResult {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return MatchResult::no_gallery();
        }
        if probe.dim() != self.dim {
            return MatchResult::unmatched();
        }
        matcher.compare(probe, &snapshot)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Arc<Vec<GalleryEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
