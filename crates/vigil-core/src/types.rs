use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Five-point facial landmarks: left eye, right eye, nose, left mouth, right mouth.
pub type Landmarks = [(f32, f32); 5];

/// Fixed-length face embedding produced by the embedding source.
///
/// The values are shared behind an `Arc` so gallery snapshots and match
/// results can hold an embedding without copying it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Arc<[f32]>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True if every component is finite (no NaN/Inf).
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance to `other`. Callers must ensure equal dimensionality.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Axis-aligned face bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One face localized in one frame. Lives only for the frame's processing.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub landmarks: Option<Landmarks>,
    pub embedding: Embedding,
}

/// A decoded RGB8 raster frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8 pixels, `width * height * 3` bytes.
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Self {
        Self { width, height, rgb }
    }

    /// Luma (BT.601) at pixel `(x, y)`, clamped to the frame edges.
    /// Returns 0 for an empty frame.
    pub fn luma_at(&self, x: i64, y: i64) -> u8 {
        if self.width == 0 || self.height == 0 {
            return 0;
        }
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        let idx = (y * self.width as usize + x) * 3;
        match self.rgb.get(idx..idx + 3) {
            Some(px) => {
                let l = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                l.round().clamp(0.0, 255.0) as u8
            }
            None => 0,
        }
    }
}
