//! Nearest-neighbour identity matching over the gallery.

use serde::Serialize;
use uuid::Uuid;

use crate::gallery::GalleryEntry;
use crate::types::Embedding;

/// Calibrated Euclidean distance below which two embeddings are the same identity.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Identity reported when no gallery entry is close enough.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Outcome of matching one probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity name, or [`UNKNOWN_IDENTITY`].
    pub identity: String,
    /// Distance to the nearest entry (`f32::INFINITY` when nothing was compared).
    pub distance: f32,
    pub is_match: bool,
    /// Id of the nearest entry, when one exists.
    pub entry_id: Option<Uuid>,
    /// Set when the gallery was empty and no comparison ran.
    pub gallery_empty: bool,
}

impl MatchResult {
    /// Result for an empty gallery: unknown, nothing computed.
    pub fn no_gallery() -> Self {
        Self {
            identity: UNKNOWN_IDENTITY.to_string(),
            distance: f32::INFINITY,
            is_match: false,
            entry_id: None,
            gallery_empty: true,
        }
    }

    /// Result when nothing comparable was found: unknown, infinite distance.
    pub fn unmatched() -> Self {
        Self {
            gallery_empty: false,
            ..Self::no_gallery()
        }
    }
}

pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Picks the entry with minimum distance; ties keep the earliest-enrolled
/// entry. O(gallery size × dimensionality) per call.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        if gallery.is_empty() {
            return MatchResult::no_gallery();
        }

        let mut best: Option<(&GalleryEntry, f32)> = None;
        for entry in gallery {
            if entry.embedding.dim() != probe.dim() {
                tracing::debug!(
                    entry_id = %entry.id,
                    expected = entry.embedding.dim(),
                    got = probe.dim(),
                    "skipping gallery entry with mismatched dimension"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&entry.embedding);
            // Strict `<` keeps the first-seen entry on ties
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((entry, distance));
            }
        }

        match best {
            Some((entry, distance)) if distance < self.tolerance => MatchResult {
                identity: entry.name.clone(),
                distance,
                is_match: true,
                entry_id: Some(entry.id),
                gallery_empty: false,
            },
            Some((entry, distance)) => MatchResult {
                identity: UNKNOWN_IDENTITY.to_string(),
                distance,
                is_match: false,
                entry_id: Some(entry.id),
                gallery_empty: false,
            },
            None => MatchResult::unmatched(),
        }
    }
}
