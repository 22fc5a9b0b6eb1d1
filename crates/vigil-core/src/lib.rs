//! vigil-core — identity matching and liveness evaluation for face video streams.
//!
//! The crate owns no camera and runs no inference. An external
//! [`EmbeddingSource`] turns a decoded [`Frame`] into face observations; this
//! crate matches them against the enrolled [`Gallery`] and accumulates
//! per-session liveness evidence in a [`LivenessStateMachine`].

pub mod gallery;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod source;
pub mod types;

pub use gallery::{Gallery, GalleryEntry, GalleryError};
pub use liveness::{LivenessConfig, LivenessState, LivenessStateMachine, LivenessVerdict};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_TOLERANCE, UNKNOWN_IDENTITY};
pub use pipeline::{FaceResult, FrameOutcome, FramePipeline, PipelineError};
pub use source::{DecodeError, EmbedderError, EmbeddingSource, FrameDecoder, ImageFrameDecoder};
pub use types::{BoundingBox, Embedding, FaceObservation, Frame, Landmarks};
