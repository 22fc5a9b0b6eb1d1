//! Per-frame orchestration: decode → extract faces → liveness → identity.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::gallery::{Gallery, GalleryEntry, GalleryError};
use crate::liveness::{LivenessStateMachine, LivenessVerdict};
use crate::matcher::EuclideanMatcher;
use crate::source::{DecodeError, EmbedderError, EmbeddingSource, FrameDecoder};
use crate::types::{BoundingBox, FaceObservation};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("embedding source failed: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("{0}")]
    Gallery(#[from] GalleryError),
}

/// Identity result for one face in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceResult {
    pub name: String,
    pub is_match: bool,
    pub bounding_box: BoundingBox,
    pub distance: f32,
}

/// Result of processing one frame, or one still image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// The gallery is empty; no detection was run.
    NothingEnrolled,
    /// Faces in frame order plus the session's single liveness verdict.
    Processed {
        #[serde(rename = "per_face_results")]
        faces: Vec<FaceResult>,
        liveness: LivenessVerdict,
    },
    /// Still-image verification: identities only, no liveness dimension.
    Checked {
        #[serde(rename = "per_face_results")]
        faces: Vec<FaceResult>,
    },
}

/// Stateless, shareable frame pipeline. Session state is passed in per call.
#[derive(Clone)]
pub struct FramePipeline {
    gallery: Arc<Gallery>,
    matcher: EuclideanMatcher,
    decoder: Arc<dyn FrameDecoder>,
    source: Arc<dyn EmbeddingSource>,
}

impl FramePipeline {
    pub fn new(
        gallery: Arc<Gallery>,
        matcher: EuclideanMatcher,
        decoder: Arc<dyn FrameDecoder>,
        source: Arc<dyn EmbeddingSource>,
    ) -> Self {
        Self {
            gallery,
            matcher,
            decoder,
            source,
        }
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Run one streamed frame through `machine`.
    ///
    /// Decode and embedder failures return an error and leave the machine's
    /// evidence untouched.
    pub fn process_frame(
        &self,
        machine: &mut LivenessStateMachine,
        bytes: &[u8],
        elapsed: Duration,
    ) -> Result<FrameOutcome, PipelineError> {
        if self.gallery.is_empty() {
            return Ok(FrameOutcome::NothingEnrolled);
        }

        let frame = self.decoder.decode(bytes)?;
        let observations = self.source.extract(&frame)?;
        let liveness = machine.update(&frame, &observations, elapsed);
        let faces = self.match_all(&observations);

        tracing::debug!(
            faces = faces.len(),
            state = ?liveness.state,
            confidence = liveness.confidence,
            "frame processed"
        );

        Ok(FrameOutcome::Processed { faces, liveness })
    }

    /// One-shot verification of a still image. Makes no liveness claim.
    pub fn check(&self, bytes: &[u8]) -> Result<FrameOutcome, PipelineError> {
        if self.gallery.is_empty() {
            return Ok(FrameOutcome::NothingEnrolled);
        }

        let frame = self.decoder.decode(bytes)?;
        let observations = self.source.extract(&frame)?;
        if observations.is_empty() {
            return Err(GalleryError::NoFace.into());
        }

        Ok(FrameOutcome::Checked {
            faces: self.match_all(&observations),
        })
    }

    /// Decode and extract the single face of an enrollment image, without
    /// touching the gallery.
    pub fn enrollment_candidate(
        &self,
        name: &str,
        bytes: &[u8],
    ) -> Result<GalleryEntry, PipelineError> {
        let frame = self.decoder.decode(bytes)?;
        let observations = self.source.extract(&frame)?;
        let face = Gallery::enrollment_face(&observations)?;
        self.gallery.validate(&face.embedding)?;
        Ok(GalleryEntry::new(name, face.embedding.clone()))
    }

    /// Enroll `name` from an image containing exactly one face.
    pub fn enroll(&self, name: &str, bytes: &[u8]) -> Result<GalleryEntry, PipelineError> {
        let entry = self.enrollment_candidate(name, bytes)?;
        self.gallery.insert(entry.clone())?;
        tracing::info!(name, entry_id = %entry.id, "enrolled");
        Ok(entry)
    }

    fn match_all(&self, observations: &[FaceObservation]) -> Vec<FaceResult> {
        let expected = self.gallery.dim();
        let mismatched = observations
            .iter()
            .filter(|face| face.embedding.dim() != expected)
            .count();
        if mismatched > 0 {
            // Once per frame, not once per gallery entry
            tracing::warn!(
                mismatched,
                expected,
                "embedder returned embeddings of the wrong dimension, reporting Unknown"
            );
        }

        observations
            .iter()
            .map(|face| {
                let m = self.gallery.match_embedding(&self.matcher, &face.embedding);
                FaceResult {
                    name: m.identity,
                    is_match: m.is_match,
                    bounding_box: face.bbox,
                    distance: m.distance,
                }
            })
            .collect()
    }
}
