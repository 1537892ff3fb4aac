//! Per-face embedding extraction.
//!
//! Every face of a detection result is resampled to the embedding network's
//! input size and embedded on the rayon pool. Faces share no state, so the
//! result does not depend on the order the workers finish in.

use crate::crop::{image_to_tensor, resample};
use crate::inference::{EmbeddingNetwork, InferenceError};
use crate::types::{DetectionResult, Embedding};
use image::RgbImage;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("embedding face {index} of {source_image} failed: {error}")]
    Inference {
        source_image: String,
        index: usize,
        #[source]
        error: InferenceError,
    },
    #[error("face {index} of {source_image} already has an embedding")]
    AlreadyEmbedded { source_image: String, index: usize },
}

/// Runs the embedding network over detected faces.
pub struct FeatureExtractor {
    network: Arc<dyn EmbeddingNetwork>,
    model_version: Option<String>,
}

impl FeatureExtractor {
    pub fn new(network: Arc<dyn EmbeddingNetwork>) -> Self {
        Self {
            network,
            model_version: None,
        }
    }

    /// Tag produced embeddings with the model that made them.
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    /// Length of every embedding this extractor produces.
    pub fn dimension(&self) -> usize {
        self.network.dimension()
    }

    /// Embed one face crop of any size. The result is L2-normalised.
    pub fn embed_crop(&self, crop: &RgbImage) -> Result<Embedding, InferenceError> {
        let size = self.network.input_size();
        let input = image_to_tensor(&resample(crop, size, size));
        let values = self.network.embed(input.view())?;

        let expected = self.network.dimension();
        if values.len() != expected {
            return Err(InferenceError::MalformedOutput(format!(
                "expected {expected}-dim embedding, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::MalformedOutput(
                "embedding contains non-finite values".into(),
            ));
        }

        Ok(Embedding {
            values,
            model_version: self.model_version.clone(),
        }
        .normalized())
    }

    /// Attach an embedding to every face of `result`, in parallel.
    ///
    /// Boxes and crops are left untouched. Any failing face fails the whole
    /// image; faces are never left half-processed in the returned value.
    pub fn extract(&self, mut result: DetectionResult) -> Result<DetectionResult, ExtractorError> {
        tracing::info!(source = %result.source, faces = result.len(), "extracting face features");

        let source = result.source.clone();
        result
            .faces
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(index, face)| {
                let embedding =
                    self.embed_crop(face.crop())
                        .map_err(|error| ExtractorError::Inference {
                            source_image: source.clone(),
                            index,
                            error,
                        })?;
                face.attach_embedding(embedding)
                    .map_err(|_| ExtractorError::AlreadyEmbedded {
                        source_image: source.clone(),
                        index,
                    })
            })?;

        Ok(result)
    }
}
