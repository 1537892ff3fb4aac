//! ONNX Runtime backends for the cascade and embedding networks.
//!
//! The proposal, refinement and output networks follow the usual cascade
//! exports: a two-channel softmax (background, face), four regression deltas
//! and, for the output network, ten landmark offsets. Which output tensor is
//! which is discovered from tensor shapes, since exports name them freely.

use crate::inference::{
    EmbeddingNetwork, InferenceError, ProposalNetwork, ScoreMap, StageNetwork, StageOutput,
};
use ndarray::ArrayView4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

// --- Named constants ---
const SCORE_CHANNELS: i64 = 2;
const REGRESSION_CHANNELS: i64 = 4;
const LANDMARK_CHANNELS: i64 = 10;
const FACE_CHANNEL: usize = 1;
const DEFAULT_INTRA_THREADS: usize = 2;

/// Output tensor indices: score, regression, optional landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
    score: usize,
    regression: usize,
    landmarks: Option<usize>,
}

/// One extracted output tensor.
struct RawTensor {
    shape: Vec<i64>,
    data: Vec<f32>,
}

fn load_session(model_path: &str, threads: usize, kind: &str) -> Result<Session, InferenceError> {
    if !Path::new(model_path).exists() {
        return Err(InferenceError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(threads)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        kind,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}

/// Run one input through the session and copy every output out.
fn run_session(
    session: &Mutex<Session>,
    input: ArrayView4<f32>,
) -> Result<Vec<RawTensor>, InferenceError> {
    let mut session = session
        .lock()
        .map_err(|_| InferenceError::InferenceFailed("session lock poisoned".into()))?;
    let output_count = session.outputs().len();

    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input)?])?;

    (0..output_count)
        .map(|idx| {
            let (shape, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                InferenceError::InferenceFailed(format!("output {idx}: {e}"))
            })?;
            Ok(RawTensor {
                shape: shape.iter().copied().collect(),
                data: data.to_vec(),
            })
        })
        .collect()
}

/// Map output tensors to roles by their channel dimension (axis 1).
///
/// Score tensors have 2 channels, regression tensors 4, landmark tensors 10.
fn discover_layout(shapes: &[Vec<i64>]) -> Result<OutputLayout, InferenceError> {
    let find = |channels: i64| shapes.iter().position(|s| s.get(1) == Some(&channels));

    match (find(SCORE_CHANNELS), find(REGRESSION_CHANNELS)) {
        (Some(score), Some(regression)) => Ok(OutputLayout {
            score,
            regression,
            landmarks: find(LANDMARK_CHANNELS),
        }),
        _ => Err(InferenceError::MalformedOutput(format!(
            "expected outputs with {SCORE_CHANNELS} and {REGRESSION_CHANNELS} channels, got shapes {shapes:?}"
        ))),
    }
}

fn dims(shape: &[i64]) -> Result<Vec<usize>, InferenceError> {
    shape
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                InferenceError::MalformedOutput(format!("dynamic or negative dim in {shape:?}"))
            })
        })
        .collect()
}

/// Decode proposal outputs shaped 1×2×H×W (scores) and 1×4×H×W (deltas).
fn decode_score_map(score: &RawTensor, regression: &RawTensor) -> Result<ScoreMap, InferenceError> {
    let s = dims(&score.shape)?;
    let r = dims(&regression.shape)?;
    if s.len() != 4 || r.len() != 4 || s[2..] != r[2..] {
        return Err(InferenceError::MalformedOutput(format!(
            "proposal outputs must be 4-D with equal grids, got {:?} and {:?}",
            score.shape, regression.shape
        )));
    }
    let (height, width) = (s[2], s[3]);
    let cells = height * width;
    if score.data.len() < 2 * cells || regression.data.len() < 4 * cells {
        return Err(InferenceError::MalformedOutput("proposal output truncated".into()));
    }

    let face = &score.data[FACE_CHANNEL * cells..(FACE_CHANNEL + 1) * cells];
    let regressions = (0..cells)
        .map(|i| std::array::from_fn(|k| regression.data[k * cells + i]))
        .collect();

    Ok(ScoreMap {
        width,
        height,
        scores: face.to_vec(),
        regressions,
    })
}

/// Decode stage outputs shaped N×2, N×4 and optionally N×10.
fn decode_stage(
    outputs: &[RawTensor],
    layout: OutputLayout,
    batch: usize,
) -> Result<StageOutput, InferenceError> {
    let score = &outputs[layout.score].data;
    let regression = &outputs[layout.regression].data;
    if score.len() != batch * 2 || regression.len() != batch * 4 {
        return Err(InferenceError::MalformedOutput(format!(
            "batch of {batch}: {} score values, {} regression values",
            score.len(),
            regression.len()
        )));
    }

    let landmarks = match layout.landmarks {
        Some(idx) => {
            let data = &outputs[idx].data;
            if data.len() != batch * 10 {
                return Err(InferenceError::MalformedOutput(format!(
                    "batch of {batch}: {} landmark values",
                    data.len()
                )));
            }
            Some(
                data.chunks_exact(10)
                    .map(|row| std::array::from_fn(|k| row[k]))
                    .collect(),
            )
        }
        None => None,
    };

    Ok(StageOutput {
        scores: score.chunks_exact(2).map(|row| row[FACE_CHANNEL]).collect(),
        regressions: regression
            .chunks_exact(4)
            .map(|row| [row[0], row[1], row[2], row[3]])
            .collect(),
        landmarks,
    })
}

/// Fully convolutional proposal network (stage 1).
pub struct OnnxProposalNet {
    session: Mutex<Session>,
}

impl OnnxProposalNet {
    pub fn load(model_path: &str) -> Result<Self, InferenceError> {
        Self::load_with_threads(model_path, DEFAULT_INTRA_THREADS)
    }

    pub fn load_with_threads(model_path: &str, threads: usize) -> Result<Self, InferenceError> {
        Ok(Self {
            session: Mutex::new(load_session(model_path, threads, "proposal")?),
        })
    }
}

impl ProposalNetwork for OnnxProposalNet {
    fn propose(&self, image: ArrayView4<f32>) -> Result<ScoreMap, InferenceError> {
        let outputs = run_session(&self.session, image)?;
        let shapes: Vec<Vec<i64>> = outputs.iter().map(|o| o.shape.clone()).collect();
        let layout = discover_layout(&shapes)?;
        decode_score_map(&outputs[layout.score], &outputs[layout.regression])
    }
}

/// Refinement or output network (stages 2 and 3).
pub struct OnnxStageNet {
    session: Mutex<Session>,
    input_size: u32,
}

impl OnnxStageNet {
    pub fn load(model_path: &str, input_size: u32) -> Result<Self, InferenceError> {
        Self::load_with_threads(model_path, input_size, DEFAULT_INTRA_THREADS)
    }

    pub fn load_with_threads(
        model_path: &str,
        input_size: u32,
        threads: usize,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            session: Mutex::new(load_session(model_path, threads, "stage")?),
            input_size,
        })
    }
}

impl StageNetwork for OnnxStageNet {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn infer(&self, batch: ArrayView4<f32>) -> Result<StageOutput, InferenceError> {
        let rows = batch.shape()[0];
        let outputs = run_session(&self.session, batch)?;
        let shapes: Vec<Vec<i64>> = outputs.iter().map(|o| o.shape.clone()).collect();
        let layout = discover_layout(&shapes)?;
        decode_stage(&outputs, layout, rows)
    }
}

/// Face embedding network (e.g. FaceNet / InceptionResNetV1).
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    input_size: u32,
    dimension: usize,
}

impl OnnxEmbedder {
    pub fn load(model_path: &str, input_size: u32, dimension: usize) -> Result<Self, InferenceError> {
        Self::load_with_threads(model_path, input_size, dimension, DEFAULT_INTRA_THREADS)
    }

    pub fn load_with_threads(
        model_path: &str,
        input_size: u32,
        dimension: usize,
        threads: usize,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            session: Mutex::new(load_session(model_path, threads, "embedding")?),
            input_size,
            dimension,
        })
    }
}

impl EmbeddingNetwork for OnnxEmbedder {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, face: ArrayView4<f32>) -> Result<Vec<f32>, InferenceError> {
        let outputs = run_session(&self.session, face)?;
        // Some exports also emit logits; pick the output of embedding length.
        outputs
            .into_iter()
            .find(|o| o.data.len() == self.dimension)
            .map(|o| o.data)
            .ok_or_else(|| {
                InferenceError::MalformedOutput(format!(
                    "no output of length {} among embedding outputs",
                    self.dimension
                ))
            })
    }
}
