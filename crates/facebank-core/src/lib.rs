//! facebank-core: cascaded face detection, embeddings and a feature bank.
//!
//! A three-stage cascade (proposal, refinement, output) finds faces over an
//! image pyramid, an embedding network turns each face crop into a feature
//! vector, and [`FeatureBank`] matches vectors against enrolled identities.
//! The networks run via ONNX Runtime; see [`onnx`].

pub mod crop;
pub mod detector;
pub mod extractor;
pub mod inference;
pub mod nms;
pub mod onnx;
pub mod pyramid;
pub mod recognizer;
pub mod store;
pub mod types;

#[cfg(test)]
mod mock;

pub use detector::{DetectorConfig, DetectorError, FaceDetector, Stage};
pub use extractor::{ExtractorError, FeatureExtractor};
pub use inference::{EmbeddingNetwork, InferenceError, ProposalNetwork, StageNetwork};
pub use nms::NmsMode;
pub use recognizer::{FaceRecognizer, Identification, LabeledSample, RecognizerError};
pub use store::{FeatureBank, Match, Matcher, StoreError};
pub use types::{BoundingBox, DetectedFace, DetectionResult, Embedding};
