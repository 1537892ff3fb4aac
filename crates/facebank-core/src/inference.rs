//! Contracts for the neural-network backends the cascade and the extractor call.
//!
//! All tensors are NCHW `f32`, RGB, normalised as in [`crate::crop`].
//! Implementations must be `Send + Sync`: the extractor calls
//! [`EmbeddingNetwork::embed`] from several worker threads at once.

use ndarray::ArrayView4;
use thiserror::Error;

/// Largest regression delta accepted, as a fraction of the box side.
pub const MAX_REGRESSION_DELTA: f32 = 10.0;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("malformed network output: {0}")]
    MalformedOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-cell output of the fully convolutional proposal network.
///
/// Cells are stored row-major: cell `(x, y)` is at index `y * width + x`.
#[derive(Debug, Clone, Default)]
pub struct ScoreMap {
    pub width: usize,
    pub height: usize,
    /// Face probability per cell.
    pub scores: Vec<f32>,
    /// Regression deltas [dx1, dy1, dx2, dy2] per cell.
    pub regressions: Vec<[f32; 4]>,
}

impl ScoreMap {
    /// Check that both per-cell vectors have `width * height` entries.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let cells = self.width * self.height;
        if self.scores.len() != cells || self.regressions.len() != cells {
            return Err(InferenceError::MalformedOutput(format!(
                "score map {}x{} expects {cells} cells, got {} scores and {} regressions",
                self.width,
                self.height,
                self.scores.len(),
                self.regressions.len()
            )));
        }
        check_values(&self.scores, &self.regressions)
    }
}

/// Scores must be probabilities and deltas finite and bounded, so a broken
/// network can never grow a box without limit.
fn check_values(scores: &[f32], regressions: &[[f32; 4]]) -> Result<(), InferenceError> {
    if let Some(score) = scores.iter().find(|s| !(0.0..=1.0).contains(*s)) {
        return Err(InferenceError::MalformedOutput(format!(
            "score {score} outside [0, 1]"
        )));
    }
    if let Some(delta) = regressions
        .iter()
        .flatten()
        .find(|d| !(d.abs() <= MAX_REGRESSION_DELTA))
    {
        return Err(InferenceError::MalformedOutput(format!(
            "regression delta {delta} outside ±{MAX_REGRESSION_DELTA}"
        )));
    }
    Ok(())
}

/// Per-candidate output of the refinement and output networks.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub scores: Vec<f32>,
    pub regressions: Vec<[f32; 4]>,
    /// Landmark offsets relative to the input box: 5 x values then 5 y values.
    pub landmarks: Option<Vec<[f32; 10]>>,
}

impl StageOutput {
    /// Check that the output has exactly one row per batch entry.
    pub fn validate(&self, batch: usize) -> Result<(), InferenceError> {
        let landmark_rows = self.landmarks.as_ref().map_or(batch, Vec::len);
        if self.scores.len() != batch || self.regressions.len() != batch || landmark_rows != batch
        {
            return Err(InferenceError::MalformedOutput(format!(
                "batch of {batch} produced {} scores, {} regressions, {landmark_rows} landmark rows",
                self.scores.len(),
                self.regressions.len()
            )));
        }
        if self
            .landmarks
            .iter()
            .flatten()
            .flatten()
            .any(|v| !v.is_finite())
        {
            return Err(InferenceError::MalformedOutput(
                "non-finite landmark offset".into(),
            ));
        }
        check_values(&self.scores, &self.regressions)
    }
}

/// Stage 1: scores every 12×12 window (stride 2) of a whole resized image.
pub trait ProposalNetwork: Send + Sync {
    /// `image` is a 1×3×H×W tensor.
    fn propose(&self, image: ArrayView4<f32>) -> Result<ScoreMap, InferenceError>;
}

/// Stages 2 and 3: re-score a batch of fixed-size square crops.
pub trait StageNetwork: Send + Sync {
    /// Side length of the square crops this network accepts.
    fn input_size(&self) -> u32;

    /// `batch` is an N×3×S×S tensor with `S = input_size()`.
    fn infer(&self, batch: ArrayView4<f32>) -> Result<StageOutput, InferenceError>;
}

/// Maps one aligned face crop to a fixed-length identity vector.
pub trait EmbeddingNetwork: Send + Sync {
    /// Side length of the square face crop this network accepts.
    fn input_size(&self) -> u32;

    /// Length of every vector `embed` returns.
    fn dimension(&self) -> usize;

    /// `face` is a 1×3×S×S tensor with `S = input_size()`.
    fn embed(&self, face: ArrayView4<f32>) -> Result<Vec<f32>, InferenceError>;
}
