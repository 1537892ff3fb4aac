//! Deterministic network stand-ins for tests.
//!
//! Scores are the mean "brightness" (max channel, in [0, 1]) of the window or
//! crop, so a bright square on a black background reads as a face. The
//! embedder summarises colour per quadrant, so differently coloured squares
//! embed far apart.

use crate::detector::{DetectorConfig, FaceDetector};
use crate::inference::{
    EmbeddingNetwork, InferenceError, ProposalNetwork, ScoreMap, StageNetwork, StageOutput,
};
use crate::pyramid::{PROPOSAL_CELL_SIZE, PROPOSAL_STRIDE};
use image::{Rgb, RgbImage};
use ndarray::ArrayView4;
use std::sync::atomic::{AtomicUsize, Ordering};

const LANDMARK_OFFSETS: [f32; 10] = [0.3, 0.7, 0.5, 0.35, 0.65, 0.4, 0.4, 0.6, 0.8, 0.8];

/// Black image with one filled square of `color`.
pub fn face_image(width: u32, height: u32, x: u32, y: u32, side: u32, color: Rgb<u8>) -> RgbImage {
    RgbImage::from_fn(width, height, |px, py| {
        if px >= x && px < x + side && py >= y && py < y + side {
            color
        } else {
            Rgb([0, 0, 0])
        }
    })
}

pub fn detector(config: DetectorConfig) -> FaceDetector {
    FaceDetector::new(
        Box::new(BrightnessProposal),
        Box::new(BrightnessStage::new(24)),
        Box::new(BrightnessStage::new(48)),
        config,
    )
    .unwrap()
}

fn intensity(v: f32) -> f32 {
    ((v * 128.0 + 127.5) / 255.0).clamp(0.0, 1.0)
}

fn brightness(t: &ArrayView4<f32>, n: usize, y: usize, x: usize) -> f32 {
    (0..3).map(|c| intensity(t[[n, c, y, x]])).fold(0.0, f32::max)
}

fn mean_brightness(
    t: &ArrayView4<f32>,
    n: usize,
    ys: std::ops::Range<usize>,
    xs: std::ops::Range<usize>,
) -> f32 {
    let count = (ys.len() * xs.len()).max(1) as f32;
    let mut sum = 0.0;
    for y in ys {
        for x in xs.clone() {
            sum += brightness(t, n, y, x);
        }
    }
    sum / count
}

pub struct BrightnessProposal;

impl ProposalNetwork for BrightnessProposal {
    fn propose(&self, image: ArrayView4<f32>) -> Result<ScoreMap, InferenceError> {
        let (h, w) = (image.shape()[2], image.shape()[3]);
        let cell = PROPOSAL_CELL_SIZE as usize;
        let stride = PROPOSAL_STRIDE as usize;
        if h < cell || w < cell {
            return Ok(ScoreMap::default());
        }
        let (gw, gh) = ((w - cell) / stride + 1, (h - cell) / stride + 1);

        let mut scores = Vec::with_capacity(gw * gh);
        for gy in 0..gh {
            for gx in 0..gw {
                let (y0, x0) = (gy * stride, gx * stride);
                scores.push(mean_brightness(&image, 0, y0..y0 + cell, x0..x0 + cell));
            }
        }

        Ok(ScoreMap {
            width: gw,
            height: gh,
            regressions: vec![[0.0; 4]; scores.len()],
            scores,
        })
    }
}

/// Brightness scores with the same deltas on every cell.
pub struct ShiftedProposal(pub [f32; 4]);

impl ProposalNetwork for ShiftedProposal {
    fn propose(&self, image: ArrayView4<f32>) -> Result<ScoreMap, InferenceError> {
        let mut map = BrightnessProposal.propose(image)?;
        map.regressions.fill(self.0);
        Ok(map)
    }
}

/// A single cell with a fixed score and deltas, whatever the input.
pub struct FixedProposal {
    score: f32,
    deltas: [f32; 4],
}

impl FixedProposal {
    pub fn new(score: f32, deltas: [f32; 4]) -> Self {
        Self { score, deltas }
    }
}

impl ProposalNetwork for FixedProposal {
    fn propose(&self, _image: ArrayView4<f32>) -> Result<ScoreMap, InferenceError> {
        Ok(ScoreMap {
            width: 1,
            height: 1,
            scores: vec![self.score],
            regressions: vec![self.deltas],
        })
    }
}

pub struct BrightnessStage {
    size: u32,
    deltas: [f32; 4],
    drop_last: bool,
}

impl BrightnessStage {
    pub fn new(size: u32) -> Self {
        Self::with_deltas(size, [0.0; 4])
    }

    /// Regresses every row by `deltas`.
    pub fn with_deltas(size: u32, deltas: [f32; 4]) -> Self {
        Self {
            size,
            deltas,
            drop_last: false,
        }
    }

    /// Returns one row fewer than the batch holds.
    pub fn truncated(size: u32) -> Self {
        Self {
            drop_last: true,
            ..Self::new(size)
        }
    }
}

impl StageNetwork for BrightnessStage {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn infer(&self, batch: ArrayView4<f32>) -> Result<StageOutput, InferenceError> {
        let (n, h, w) = (batch.shape()[0], batch.shape()[2], batch.shape()[3]);
        let mut rows = n;
        if self.drop_last {
            rows = rows.saturating_sub(1);
        }
        let scores: Vec<f32> = (0..rows)
            .map(|i| mean_brightness(&batch, i, 0..h, 0..w))
            .collect();
        Ok(StageOutput {
            regressions: vec![self.deltas; rows],
            landmarks: Some(vec![LANDMARK_OFFSETS; rows]),
            scores,
        })
    }
}

pub struct FailingProposal;

impl ProposalNetwork for FailingProposal {
    fn propose(&self, _image: ArrayView4<f32>) -> Result<ScoreMap, InferenceError> {
        Err(InferenceError::InferenceFailed("proposal backend unavailable".into()))
    }
}

pub struct FailingStage {
    size: u32,
}

impl FailingStage {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl StageNetwork for FailingStage {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn infer(&self, _batch: ArrayView4<f32>) -> Result<StageOutput, InferenceError> {
        Err(InferenceError::InferenceFailed("stage backend unavailable".into()))
    }
}

/// 12-dimensional embedding: mean R, G, B intensity of each crop quadrant.
///
/// Counts its calls so tests can check every face was embedded once.
pub struct ColorEmbedder {
    size: u32,
    pub calls: AtomicUsize,
    output: Output,
}

#[derive(Clone, Copy, PartialEq)]
enum Output {
    Colors,
    Error,
    Nan,
}

impl ColorEmbedder {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            calls: AtomicUsize::new(0),
            output: Output::Colors,
        }
    }

    pub fn failing(size: u32) -> Self {
        Self {
            output: Output::Error,
            ..Self::new(size)
        }
    }

    /// Succeeds, but with a NaN in every vector.
    pub fn non_finite(size: u32) -> Self {
        Self {
            output: Output::Nan,
            ..Self::new(size)
        }
    }
}

impl EmbeddingNetwork for ColorEmbedder {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn dimension(&self) -> usize {
        12
    }

    fn embed(&self, face: ArrayView4<f32>) -> Result<Vec<f32>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.output == Output::Error {
            return Err(InferenceError::InferenceFailed("embedder unavailable".into()));
        }
        let (h, w) = (face.shape()[2], face.shape()[3]);
        let (hh, hw) = (h / 2, w / 2);
        let quadrants = [(0..hh, 0..hw), (0..hh, hw..w), (hh..h, 0..hw), (hh..h, hw..w)];

        let mut values = Vec::with_capacity(12);
        for (ys, xs) in quadrants {
            let count = (ys.len() * xs.len()).max(1) as f32;
            for c in 0..3 {
                let mut sum = 0.0;
                for y in ys.clone() {
                    for x in xs.clone() {
                        sum += intensity(face[[0, c, y, x]]);
                    }
                }
                values.push(sum / count);
            }
        }
        if self.output == Output::Nan {
            values[0] = f32::NAN;
        }
        Ok(values)
    }
}
