//! Collaborator seams: turning frame bytes into a raster, and a raster into faces.

use thiserror::Error;

use crate::types::{FaceObservation, Frame};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty frame payload")]
    Empty,
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedder I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedder protocol error: {0}")]
    Protocol(String),
    #[error("embedder unavailable")]
    Unavailable,
    #[error("embedder did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Face detector + embedder. Returns zero or more faces for one frame.
///
/// Implementations must be shareable across sessions; any per-call mutable
/// state is the implementation's own concern.
pub trait EmbeddingSource: Send + Sync {
    fn extract(&self, frame: &Frame) -> Result<Vec<FaceObservation>, EmbedderError>;
}

/// Decodes an encoded frame (JPEG, PNG, ...) into an RGB raster.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError>;
}

/// [`FrameDecoder`] backed by the `image` crate, format sniffed from the bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFrameDecoder;

impl FrameDecoder for ImageFrameDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Frame::new(width, height, rgb.into_raw()))
    }
}
