//! Passive, per-session liveness evaluation over a video stream.
//!
//! A static photograph or a frozen replay produces near-identical facial
//! landmark positions and near-identical face texture across consecutive
//! frames. A live person exhibits involuntary micro-saccades, eye drift and
//! small expression changes that show up as both landmark displacement and
//! pixel-level change inside the face region.
//!
//! Each face-bearing frame is compared against the previous one and scored
//! in `[0, 1]`. Both signals are measured above a noise floor: texture is
//! compared on coarse block means, so per-pixel sensor noise on a held-up
//! photo averages out instead of reading as change. Scores are averaged over
//! a warm-up window and then smoothed with an exponential moving average; the state only moves once the
//! smoothed score leaves the band between the spoof and live thresholds, so
//! a single anomalous frame cannot flip the verdict.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and still images shown on a screen.
//! - **Does not block:** Video replay with natural motion, high-quality 3D
//!   masks, or adversarial displays.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::{BoundingBox, FaceObservation, Frame};

/// Side length of the luma patch sampled from the face region.
const PATCH_SIZE: usize = 24;
/// Side length of the blocks averaged before patches are compared.
const BLOCK_SIZE: usize = 4;
/// Ceiling on `Analyzing` confidence: an undetermined verdict is never certain.
const UNDETERMINED_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    Analyzing,
    Live,
    Spoof,
}

/// Per-frame liveness verdict for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessVerdict {
    pub state: LivenessState,
    /// Confidence in `state`, in `[0, 1]`.
    pub confidence: f32,
    pub message: String,
}

#[derive(Error, Debug, PartialEq)]
pub enum LivenessConfigError {
    #[error("warm-up window must be at least one frame")]
    ZeroWarmup,
    #[error("smoothing factor must be in (0, 1], got {0}")]
    Smoothing(f32),
    #[error("spoof threshold ({spoof}) must be below live threshold ({live})")]
    Thresholds { spoof: f32, live: f32 },
    #[error("motion weight must be in [0, 1], got {0}")]
    MotionWeight(f32),
    #[error("noise floors must be non-negative")]
    NoiseFloor,
}

/// Tuning for [`LivenessStateMachine`].
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Scored frames required before a definitive verdict.
    pub warmup_frames: usize,
    /// EMA factor applied once the warm-up window is full.
    pub smoothing: f32,
    /// Smoothed score at or above which the session is considered live.
    pub live_threshold: f32,
    /// Smoothed score at or below which the session is considered a spoof.
    pub spoof_threshold: f32,
    /// Eye displacement per nominal frame interval (pixels) attributed to
    /// landmark jitter and ignored. A printed photo produces <0.3 px.
    pub motion_noise_floor: f32,
    /// Displacement above the noise floor that earns a full motion score.
    pub min_displacement: f32,
    /// Mean absolute change of face block means (luma) ignored as sensor noise.
    pub patch_noise_floor: f32,
    /// Block-mean change above the noise floor that earns a full texture score.
    pub min_patch_delta: f32,
    /// Weight of the motion signal; texture gets the remainder.
    pub motion_weight: f32,
    /// Frame interval that displacement is normalised to (30 fps).
    pub nominal_frame_interval: Duration,
    /// Gaps longer than this reset the motion reference instead of scoring.
    pub max_gap: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            warmup_frames: 10,
            smoothing: 0.2,
            live_threshold: 0.6,
            spoof_threshold: 0.35,
            motion_noise_floor: 0.5,
            min_displacement: 0.8,
            patch_noise_floor: 1.5,
            min_patch_delta: 3.0,
            motion_weight: 0.6,
            nominal_frame_interval: Duration::from_millis(33),
            max_gap: Duration::from_secs(2),
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<(), LivenessConfigError> {
        if self.warmup_frames == 0 {
            return Err(LivenessConfigError::ZeroWarmup);
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(LivenessConfigError::Smoothing(self.smoothing));
        }
        if self.spoof_threshold >= self.live_threshold {
            return Err(LivenessConfigError::Thresholds {
                spoof: self.spoof_threshold,
                live: self.live_threshold,
            });
        }
        if !(0.0..=1.0).contains(&self.motion_weight) {
            return Err(LivenessConfigError::MotionWeight(self.motion_weight));
        }
        if !(self.motion_noise_floor >= 0.0 && self.patch_noise_floor >= 0.0) {
            return Err(LivenessConfigError::NoiseFloor);
        }
        Ok(())
    }
}

/// What is remembered about the dominant face of the previous frame.
#[derive(Debug, Clone)]
struct FaceSample {
    /// Left and right eye centres, or the box centre twice without landmarks.
    anchors: [(f32, f32); 2],
    /// Block means of the face patch.
    blocks: Vec<f32>,
}

impl FaceSample {
    fn capture(frame: &Frame, face: &FaceObservation) -> Self {
        let anchors = match face.landmarks {
            Some(lm) => [lm[0], lm[1]],
            None => {
                let c = face.bbox.center();
                [c, c]
            }
        };
        Self {
            anchors,
            blocks: block_means(&sample_patch(frame, &face.bbox)),
        }
    }
}

/// Accumulated signals for one session. Cleared by [`LivenessStateMachine::reset`].
#[derive(Debug, Clone, Default)]
struct LivenessEvidence {
    /// Number of scored frame pairs.
    samples: usize,
    /// Smoothed liveness score in `[0, 1]`.
    score: f32,
    previous: Option<FaceSample>,
    /// Time since `previous` was captured, across faceless frames.
    since_previous: Duration,
}

/// Per-session liveness state machine.
///
/// Owned by exactly one session's processing flow; needs no internal locking.
#[derive(Debug, Clone)]
pub struct LivenessStateMachine {
    config: LivenessConfig,
    evidence: LivenessEvidence,
    state: LivenessState,
    last_confidence: f32,
}

impl LivenessStateMachine {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            evidence: LivenessEvidence::default(),
            state: LivenessState::Analyzing,
            last_confidence: 0.0,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Number of frame pairs that have contributed evidence.
    pub fn samples(&self) -> usize {
        self.evidence.samples
    }

    /// Current smoothed liveness score.
    pub fn score(&self) -> f32 {
        self.evidence.score
    }

    /// Clear all evidence and return to [`LivenessState::Analyzing`].
    pub fn reset(&mut self) {
        self.evidence = LivenessEvidence::default();
        self.state = LivenessState::Analyzing;
        self.last_confidence = 0.0;
    }

    /// Consume one frame and the faces localized in it.
    ///
    /// `elapsed` is the wall-clock time since the previous update for this
    /// session. Frames without a face leave the evidence untouched and report
    /// `Analyzing` with the previous confidence; the next face is compared
    /// against the last one seen, over the whole interval.
    pub fn update(
        &mut self,
        frame: &Frame,
        faces: &[FaceObservation],
        elapsed: Duration,
    ) -> LivenessVerdict {
        self.evidence.since_previous = self.evidence.since_previous.saturating_add(elapsed);

        // Dominant face: largest box
        let Some(face) = faces
            .iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
        else {
            return LivenessVerdict {
                state: LivenessState::Analyzing,
                confidence: self.last_confidence,
                message: "no face in frame".to_string(),
            };
        };

        let sample = FaceSample::capture(frame, face);
        let interval = std::mem::take(&mut self.evidence.since_previous);
        if let Some(previous) = self.evidence.previous.take() {
            if interval <= self.config.max_gap {
                let frame_score = self.score_pair(&previous, &sample, interval);
                self.accumulate(frame_score);
            } else {
                tracing::debug!(
                    interval_ms = interval.as_millis() as u64,
                    "liveness: gap too long, resetting motion reference"
                );
            }
        }
        self.evidence.previous = Some(sample);

        self.transition();
        let verdict = self.verdict();
        self.last_confidence = verdict.confidence;
        verdict
    }

    fn score_pair(&self, prev: &FaceSample, curr: &FaceSample, elapsed: Duration) -> f32 {
        let displacement = prev
            .anchors
            .iter()
            .zip(curr.anchors.iter())
            .map(|(a, b)| {
                let dx = b.0 - a.0;
                let dy = b.1 - a.1;
                (dx * dx + dy * dy).sqrt()
            })
            .sum::<f32>()
            / 2.0;

        // Long intervals accumulate more drift; scale down to one nominal frame
        let intervals = (elapsed.as_secs_f32()
            / self.config.nominal_frame_interval.as_secs_f32().max(f32::EPSILON))
        .max(1.0);
        let per_frame = displacement / intervals;

        let motion = ratio_score(
            per_frame - self.config.motion_noise_floor,
            self.config.min_displacement,
        );
        let texture = ratio_score(
            mean_abs_diff(&prev.blocks, &curr.blocks) - self.config.patch_noise_floor,
            self.config.min_patch_delta,
        );

        let w = self.config.motion_weight;
        w * motion + (1.0 - w) * texture
    }

    fn accumulate(&mut self, frame_score: f32) {
        let ev = &mut self.evidence;
        ev.samples += 1;
        if ev.samples <= self.config.warmup_frames {
            // Running mean until the window fills
            ev.score += (frame_score - ev.score) / ev.samples as f32;
        } else {
            ev.score += self.config.smoothing * (frame_score - ev.score);
        }
        ev.score = ev.score.clamp(0.0, 1.0);
    }

    fn transition(&mut self) {
        if self.evidence.samples < self.config.warmup_frames {
            return;
        }
        let score = self.evidence.score;
        let next = if score >= self.config.live_threshold {
            LivenessState::Live
        } else if score <= self.config.spoof_threshold {
            LivenessState::Spoof
        } else {
            self.state
        };
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, score, "liveness: state change");
            self.state = next;
        }
    }

    fn verdict(&self) -> LivenessVerdict {
        let warmed_up = self.evidence.samples >= self.config.warmup_frames;
        let (confidence, message) = match self.state {
            LivenessState::Analyzing => {
                let progress =
                    self.evidence.samples as f32 / self.config.warmup_frames as f32;
                let message = if warmed_up {
                    "analyzing"
                } else {
                    "insufficient evidence"
                };
                (progress.min(1.0) * UNDETERMINED_CONFIDENCE, message)
            }
            LivenessState::Live => (self.evidence.score, "verified live"),
            LivenessState::Spoof => (1.0 - self.evidence.score, "static image detected"),
        };
        LivenessVerdict {
            state: self.state,
            confidence: confidence.clamp(0.0, 1.0),
            message: message.to_string(),
        }
    }
}

fn ratio_score(value: f32, full_at: f32) -> f32 {
    if full_at <= 0.0 {
        return 1.0;
    }
    (value / full_at).clamp(0.0, 1.0)
}

/// Nearest-neighbour resample of the face region to a square luma patch.
fn sample_patch(frame: &Frame, bbox: &BoundingBox) -> Vec<u8> {
    let step_x = bbox.width / PATCH_SIZE as f32;
    let step_y = bbox.height / PATCH_SIZE as f32;
    let mut patch = Vec::with_capacity(PATCH_SIZE * PATCH_SIZE);
    for py in 0..PATCH_SIZE {
        let y = bbox.y + (py as f32 + 0.5) * step_y;
        for px in 0..PATCH_SIZE {
            let x = bbox.x + (px as f32 + 0.5) * step_x;
            patch.push(frame.luma_at(x as i64, y as i64));
        }
    }
    patch
}

/// Mean luma of each `BLOCK_SIZE`² block of a square patch, row-major.
fn block_means(patch: &[u8]) -> Vec<f32> {
    let blocks = PATCH_SIZE / BLOCK_SIZE;
    let mut means = vec![0.0f32; blocks * blocks];
    for (i, &v) in patch.iter().enumerate().take(PATCH_SIZE * PATCH_SIZE) {
        let (y, x) = (i / PATCH_SIZE, i % PATCH_SIZE);
        means[(y / BLOCK_SIZE) * blocks + x / BLOCK_SIZE] += v as f32;
    }
    let n = (BLOCK_SIZE * BLOCK_SIZE) as f32;
    means.iter_mut().for_each(|m| *m /= n);
    means
}

fn mean_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let total: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum();
    total / n as f32
}
