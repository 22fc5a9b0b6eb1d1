//! Test doubles for the decoder and embedder collaborators.
//!
//! Frame payloads are `[seed, tag, ..]`: `seed` picks the texture and `tag`
//! selects which script queue the embedder answers from, so concurrent
//! sessions can be driven independently through one shared embedder.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use vigil_core::{
    BoundingBox, DecodeError, Embedding, EmbedderError, EmbeddingSource, EuclideanMatcher,
    FaceObservation, Frame, FrameDecoder, FramePipeline, Gallery, GalleryEntry,
};

pub const DIM: usize = 3;

pub struct SeedDecoder;

impl FrameDecoder for SeedDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        let (&seed, rest) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let tag = rest.first().copied().unwrap_or(0);
        let mut rgb = Vec::with_capacity(64 * 64 * 3);
        for y in 0..64u32 {
            for x in 0..64u32 {
                let v = ((x * 7 + y * 13 + seed as u32 * 31) % 256) as u8;
                rgb.extend_from_slice(&[v, v, v]);
            }
        }
        rgb[0] = tag;
        Ok(Frame::new(64, 64, rgb))
    }
}

#[derive(Default)]
pub struct FaceScript {
    queues: Mutex<HashMap<u8, VecDeque<Vec<FaceObservation>>>>,
}

impl FaceScript {
    pub fn push(&self, session: &str, faces: Vec<FaceObservation>) {
        let tag = session.as_bytes().first().copied().unwrap_or(0);
        self.queues
            .lock()
            .unwrap()
            .entry(tag)
            .or_default()
            .push_back(faces);
    }
}

impl EmbeddingSource for FaceScript {
    fn extract(&self, frame: &Frame) -> Result<Vec<FaceObservation>, EmbedderError> {
        let tag = frame.rgb[0];
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get_mut(&tag)
            .and_then(|q| q.pop_front())
            .unwrap_or_default())
    }
}

pub fn face_at(x: f32, values: Vec<f32>) -> FaceObservation {
    FaceObservation {
        bbox: BoundingBox::new(x, 8.0, 40.0, 40.0),
        landmarks: None,
        embedding: Embedding::new(values),
    }
}

/// A face of enrolled identity "A" that shifts by 2 px every other frame.
pub fn live_face(i: u8) -> FaceObservation {
    face_at(8.0 + (i % 2) as f32 * 2.0, vec![1.0, 0.0, 0.0])
}

/// A face of identity "A" frozen in place.
pub fn still_face() -> FaceObservation {
    face_at(8.0, vec![1.0, 0.0, 0.0])
}

pub fn pipeline_with(gallery: Arc<Gallery>) -> (FramePipeline, Arc<FaceScript>) {
    let script = Arc::new(FaceScript::default());
    let pipeline = FramePipeline::new(
        gallery,
        EuclideanMatcher::default(),
        Arc::new(SeedDecoder),
        script.clone(),
    );
    (pipeline, script)
}

/// Pipeline whose gallery already holds identity "A".
pub fn seed_pipeline() -> (FramePipeline, Arc<FaceScript>) {
    let gallery = Gallery::new(DIM);
    gallery
        .insert(GalleryEntry::new("A", Embedding::new(vec![1.0, 0.0, 0.0])))
        .unwrap();
    pipeline_with(Arc::new(gallery))
}
