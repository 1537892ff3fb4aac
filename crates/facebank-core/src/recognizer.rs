//! Recognition pipeline: detect → crop → embed, then enroll into or query a
//! [`FeatureBank`].

use crate::crop::crop_region;
use crate::detector::{DetectorError, FaceDetector};
use crate::extractor::{ExtractorError, FeatureExtractor};
use crate::store::{FeatureBank, Match, StoreError};
use crate::types::{BoundingBox, DetectedFace, DetectionResult, Embedding};
use image::RgbImage;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("detection failed for {source_image}: {error}")]
    Detection {
        source_image: String,
        #[source]
        error: DetectorError,
    },
    #[error(transparent)]
    Extraction(#[from] ExtractorError),
    #[error("storing features of {source_image} failed: {error}")]
    Store {
        source_image: String,
        #[source]
        error: StoreError,
    },
}

/// One labelled reference image for enrollment.
pub struct LabeledSample {
    pub label: String,
    pub source: String,
    pub image: RgbImage,
}

/// Outcome of enrolling one sample of a batch.
#[derive(Debug)]
pub struct EnrollOutcome {
    pub source: String,
    pub label: String,
    /// Number of faces stored, or why the sample was skipped.
    pub result: Result<usize, RecognizerError>,
}

/// Query answer for one face of a probe image.
#[derive(Debug, Clone)]
pub struct Identification {
    pub bbox: BoundingBox,
    /// Best match, or `None` when nothing in the bank is similar enough.
    pub matched: Option<Match>,
}

/// Detector and extractor bundled into the enroll / identify workflow.
pub struct FaceRecognizer {
    detector: FaceDetector,
    extractor: FeatureExtractor,
    debug_dir: Option<PathBuf>,
}

impl FaceRecognizer {
    pub fn new(detector: FaceDetector, extractor: FeatureExtractor) -> Self {
        Self {
            detector,
            extractor,
            debug_dir: None,
        }
    }

    /// While debug logging is enabled, write every detected face crop to
    /// `dir` as `{index}_{source file name}`.
    pub fn with_debug_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dir = Some(dir.into());
        self
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Detect faces and crop each one at native resolution. No embeddings yet.
    pub fn recognize_faces(
        &self,
        source: &str,
        image: &RgbImage,
    ) -> Result<DetectionResult, RecognizerError> {
        let boxes = self
            .detector
            .detect(image)
            .map_err(|error| RecognizerError::Detection {
                source_image: source.to_string(),
                error,
            })?;

        let faces = boxes
            .into_iter()
            .map(|bbox| DetectedFace::new(crop_region(image, &bbox), bbox))
            .collect::<Vec<_>>();
        if faces.is_empty() {
            tracing::warn!(source, "no face recognized in image");
        }
        Ok(DetectionResult::new(source, faces))
    }

    /// Attach embeddings to every face of `result`.
    pub fn extract_features(
        &self,
        result: DetectionResult,
    ) -> Result<DetectionResult, RecognizerError> {
        Ok(self.extractor.extract(result)?)
    }

    /// Detect faces in `image` and embed each of them.
    pub fn face_features(
        &self,
        source: &str,
        image: &RgbImage,
    ) -> Result<DetectionResult, RecognizerError> {
        tracing::info!(source, "face features: start");
        let detected = self.recognize_faces(source, image)?;
        self.dump_faces(&detected);

        if detected.is_empty() {
            return Ok(detected);
        }

        let result = self.extract_features(detected)?;
        tracing::info!(source, faces = result.len(), "face features: done");
        Ok(result)
    }

    fn dump_faces(&self, result: &DetectionResult) {
        let Some(dir) = &self.debug_dir else {
            return;
        };
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let file_name = Path::new(&result.source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "face.png".to_string());
        for (i, face) in result.faces.iter().enumerate() {
            let path = dir.join(format!("{i}_{file_name}"));
            match face.crop().save(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "face crop written"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not write face crop")
                }
            }
        }
    }

    /// Store every face found in `image` under `label`; returns how many.
    pub fn enroll(
        &self,
        bank: &FeatureBank,
        label: &str,
        source: &str,
        image: &RgbImage,
    ) -> Result<usize, RecognizerError> {
        let result = self.face_features(source, image)?;
        let embeddings: Vec<Embedding> = result
            .faces
            .into_iter()
            .filter_map(DetectedFace::into_embedding)
            .collect();

        // One write for the whole image: a rejected face stores none of them.
        let stored = bank
            .put_all(label, embeddings)
            .map_err(|error| RecognizerError::Store {
                source_image: source.to_string(),
                error,
            })?;

        tracing::info!(source, label, faces = stored, "enrolled");
        Ok(stored)
    }

    /// Enroll many samples in parallel. A failing sample is reported in its
    /// outcome and never stops the others.
    pub fn enroll_batch(&self, bank: &FeatureBank, samples: &[LabeledSample]) -> Vec<EnrollOutcome> {
        samples
            .par_iter()
            .map(|sample| {
                let result = self.enroll(bank, &sample.label, &sample.source, &sample.image);
                if let Err(e) = &result {
                    tracing::warn!(source = %sample.source, error = %e, "enrollment skipped");
                }
                EnrollOutcome {
                    source: sample.source.clone(),
                    label: sample.label.clone(),
                    result,
                }
            })
            .collect()
    }

    /// Look up the best bank match for every face in `image`.
    pub fn identify(
        &self,
        bank: &FeatureBank,
        source: &str,
        image: &RgbImage,
    ) -> Result<Vec<Identification>, RecognizerError> {
        let result = self.face_features(source, image)?;

        result
            .faces
            .into_iter()
            .filter_map(|face| {
                let bbox = face.bbox().clone();
                face.into_embedding().map(|embedding| (bbox, embedding))
            })
            .map(|(bbox, embedding)| -> Result<Identification, RecognizerError> {
                let matched =
                    bank.get_similar(&embedding)
                        .map_err(|error| RecognizerError::Store {
                            source_image: source.to_string(),
                            error,
                        })?;
                match &matched {
                    Some(m) => tracing::info!(
                        source,
                        label = %m.label,
                        similarity = m.similarity,
                        "face identified"
                    ),
                    None => tracing::info!(source, "face not matched"),
                }
                Ok(Identification { bbox, matched })
            })
            .collect()
    }
}
