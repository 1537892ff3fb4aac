//! Three-stage cascaded face detector.
//!
//! Proposal → Refinement → Output. Each stage narrows the candidate set of the
//! previous one; boxes are regressed and squared between stages and the final
//! boxes are clipped to the image.

use crate::crop::{batch_to_tensor, crop_resized, image_to_tensor};
use crate::inference::{InferenceError, ProposalNetwork, ScoreMap, StageNetwork, StageOutput};
use crate::nms::{nms, NmsMode};
use crate::pyramid::{pyramid, PROPOSAL_CELL_SIZE, PROPOSAL_STRIDE};
use crate::types::BoundingBox;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// --- Defaults of the classic cascade ---
const DEFAULT_MIN_FACE_SIZE: u32 = 20;
const DEFAULT_SCALE_FACTOR: f32 = 0.709;
const DEFAULT_THRESHOLDS: [f32; 3] = [0.6, 0.7, 0.7];
const DEFAULT_PROPOSAL_SCALE_NMS: f32 = 0.5;
const DEFAULT_PROPOSAL_NMS: f32 = 0.7;
const DEFAULT_REFINE_NMS: f32 = 0.7;
const DEFAULT_OUTPUT_NMS: f32 = 0.7;

/// Cascade stage, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Proposal,
    Refinement,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Proposal => "proposal",
            Stage::Refinement => "refinement",
            Stage::Output => "output",
        })
    }
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid detector config: {0}")]
    InvalidConfig(String),
    #[error("{stage} stage failed: {source}")]
    Inference {
        stage: Stage,
        #[source]
        source: InferenceError,
    },
}

impl DetectorError {
    fn at(stage: Stage) -> impl FnOnce(InferenceError) -> Self {
        move |source| DetectorError::Inference { stage, source }
    }
}

/// Tunable detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Smallest face side, in source pixels, the pyramid is built to find.
    pub min_face_size: u32,
    /// Ratio between consecutive pyramid scales, in (0, 1).
    pub scale_factor: f32,
    /// Score thresholds for the proposal, refinement and output stages.
    pub thresholds: [f32; 3],
    /// IoU threshold for NMS within one pyramid scale.
    pub proposal_scale_nms: f32,
    /// IoU threshold for NMS across all pyramid scales.
    pub proposal_nms: f32,
    /// IoU threshold after refinement.
    pub refine_nms: f32,
    /// Intersection-over-min threshold after the output stage.
    pub output_nms: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            scale_factor: DEFAULT_SCALE_FACTOR,
            thresholds: DEFAULT_THRESHOLDS,
            proposal_scale_nms: DEFAULT_PROPOSAL_SCALE_NMS,
            proposal_nms: DEFAULT_PROPOSAL_NMS,
            refine_nms: DEFAULT_REFINE_NMS,
            output_nms: DEFAULT_OUTPUT_NMS,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.min_face_size == 0 {
            return Err(DetectorError::InvalidConfig(
                "min_face_size must be at least 1".into(),
            ));
        }
        if !(self.scale_factor > 0.0 && self.scale_factor < 1.0) {
            return Err(DetectorError::InvalidConfig(format!(
                "scale_factor must be in (0, 1), got {}",
                self.scale_factor
            )));
        }
        let unit = [
            ("threshold", self.thresholds[0]),
            ("threshold", self.thresholds[1]),
            ("threshold", self.thresholds[2]),
            ("proposal_scale_nms", self.proposal_scale_nms),
            ("proposal_nms", self.proposal_nms),
            ("refine_nms", self.refine_nms),
            ("output_nms", self.output_nms),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectorError::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Survivors of every stage for one image.
#[derive(Debug, Clone, Default)]
pub struct CascadeTrace {
    /// Squared candidates leaving the proposal stage.
    pub proposals: Vec<BoundingBox>,
    /// Squared candidates leaving the refinement stage.
    pub refined: Vec<BoundingBox>,
    /// Final, clipped face boxes.
    pub faces: Vec<BoundingBox>,
}

/// Cascaded face detector over three pluggable networks.
pub struct FaceDetector {
    proposal: Box<dyn ProposalNetwork>,
    refinement: Box<dyn StageNetwork>,
    output: Box<dyn StageNetwork>,
    config: DetectorConfig,
}

impl FaceDetector {
    pub fn new(
        proposal: Box<dyn ProposalNetwork>,
        refinement: Box<dyn StageNetwork>,
        output: Box<dyn StageNetwork>,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        config.validate()?;
        if refinement.input_size() == 0 || output.input_size() == 0 {
            return Err(DetectorError::InvalidConfig(
                "stage networks must report a non-zero input size".into(),
            ));
        }
        Ok(Self {
            proposal,
            refinement,
            output,
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect faces, returning calibrated boxes clipped to the image.
    ///
    /// Boxes come in NMS order: descending score, and on equal scores the
    /// box that entered the output stage first.
    ///
    /// An empty list means no face was found; any network failure aborts
    /// the whole cascade with an error.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.trace(image)?.faces)
    }

    /// Run the cascade and keep every stage's survivors.
    pub fn trace(&self, image: &RgbImage) -> Result<CascadeTrace, DetectorError> {
        let proposals = self.run_proposal(image)?;
        tracing::debug!(count = proposals.len(), "proposal stage done");

        let refined = self.run_refinement(image, &proposals)?;
        tracing::debug!(count = refined.len(), "refinement stage done");

        let faces = self.run_output(image, &refined)?;
        tracing::debug!(count = faces.len(), "output stage done");

        Ok(CascadeTrace {
            proposals,
            refined,
            faces,
        })
    }

    fn run_proposal(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let cfg = &self.config;
        let mut pooled = Vec::new();

        for level in pyramid(image, cfg.min_face_size, cfg.scale_factor) {
            let tensor = image_to_tensor(&level.image);
            let map = self
                .proposal
                .propose(tensor.view())
                .and_then(|map| map.validate().map(|_| map))
                .map_err(DetectorError::at(Stage::Proposal))?;

            let candidates = generate_boxes(&map, level.scale, cfg.thresholds[0]);
            tracing::trace!(scale = level.scale, candidates = candidates.len(), "pyramid level");
            pooled.extend(nms(candidates, cfg.proposal_scale_nms, NmsMode::Union));
        }

        Ok(nms(pooled, cfg.proposal_nms, NmsMode::Union)
            .iter()
            .map(|b| b.calibrate().square().round())
            .filter(BoundingBox::is_valid)
            .collect())
    }

    fn run_refinement(
        &self,
        image: &RgbImage,
        candidates: &[BoundingBox],
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let out = run_stage(&*self.refinement, Stage::Refinement, image, candidates)?;
        let survivors = rescore(candidates, &out, self.config.thresholds[1]);

        Ok(nms(survivors, self.config.refine_nms, NmsMode::Union)
            .iter()
            .map(|b| b.calibrate().square().round())
            .filter(BoundingBox::is_valid)
            .collect())
    }

    fn run_output(
        &self,
        image: &RgbImage,
        candidates: &[BoundingBox],
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let out = run_stage(&*self.output, Stage::Output, image, candidates)?;
        let calibrated = rescore(candidates, &out, self.config.thresholds[2])
            .iter()
            .map(BoundingBox::calibrate)
            .collect();

        let (width, height) = image.dimensions();
        Ok(nms(calibrated, self.config.output_nms, NmsMode::Min)
            .iter()
            .map(|b| b.clip(width, height))
            .filter(BoundingBox::is_valid)
            .collect())
    }
}

/// Turn proposal cells scoring above `threshold` into boxes in source coordinates.
fn generate_boxes(map: &ScoreMap, scale: f32, threshold: f32) -> Vec<BoundingBox> {
    let stride = PROPOSAL_STRIDE as f32;
    let cell = PROPOSAL_CELL_SIZE as f32;
    let mut boxes = Vec::new();

    for y in 0..map.height {
        for x in 0..map.width {
            let idx = y * map.width + x;
            let score = map.scores[idx];
            // Written so NaN never passes.
            if !(score > threshold) {
                continue;
            }
            let (gx, gy) = (x as f32 * stride, y as f32 * stride);
            boxes.push(BoundingBox {
                regression: map.regressions[idx],
                ..BoundingBox::new(
                    gx / scale,
                    gy / scale,
                    (gx + cell) / scale,
                    (gy + cell) / scale,
                    score,
                )
            });
        }
    }

    boxes
}

/// Crop every candidate to the network's input size and run one batch.
fn run_stage(
    network: &dyn StageNetwork,
    stage: Stage,
    image: &RgbImage,
    candidates: &[BoundingBox],
) -> Result<StageOutput, DetectorError> {
    let size = network.input_size();
    let crops: Vec<RgbImage> = candidates
        .iter()
        .map(|b| crop_resized(image, b, size))
        .collect();
    let batch = batch_to_tensor(&crops);

    network
        .infer(batch.view())
        .and_then(|out| out.validate(candidates.len()).map(|_| out))
        .map_err(DetectorError::at(stage))
}

/// Keep candidates whose new score reaches `threshold`, carrying the new
/// score, deltas and (if present) landmarks mapped into image space.
fn rescore(candidates: &[BoundingBox], out: &StageOutput, threshold: f32) -> Vec<BoundingBox> {
    candidates
        .iter()
        .enumerate()
        .filter(|&(i, _)| out.scores[i] >= threshold)
        .map(|(i, b)| {
            let landmarks = out.landmarks.as_ref().map(|rows| {
                let offsets = &rows[i];
                let (w, h) = (b.width(), b.height());
                std::array::from_fn(|k| (b.x1 + w * offsets[k], b.y1 + h * offsets[k + 5]))
            });
            BoundingBox {
                score: out.scores[i],
                regression: out.regressions[i],
                landmarks: landmarks.or(b.landmarks),
                ..b.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        self, BrightnessProposal, BrightnessStage, FailingProposal, FailingStage, FixedProposal,
        ShiftedProposal,
    };
    use image::Rgb;

    fn detector() -> FaceDetector {
        mock::detector(DetectorConfig::default())
    }

    #[test]
    fn test_default_config_valid() {
        assert!(DetectorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad_factor = DetectorConfig {
            scale_factor: 1.2,
            ..DetectorConfig::default()
        };
        assert!(matches!(
            bad_factor.validate(),
            Err(DetectorError::InvalidConfig(_))
        ));

        let bad_threshold = DetectorConfig {
            thresholds: [0.6, 1.5, 0.7],
            ..DetectorConfig::default()
        };
        assert!(bad_threshold.validate().is_err());

        let result = FaceDetector::new(
            Box::new(BrightnessProposal),
            Box::new(BrightnessStage::new(24)),
            Box::new(BrightnessStage::new(48)),
            DetectorConfig {
                min_face_size: 0,
                ..DetectorConfig::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: DetectorConfig =
            serde_json::from_str(r#"{"min_face_size": 40, "thresholds": [0.5, 0.6, 0.8]}"#)
                .unwrap();
        assert_eq!(cfg.min_face_size, 40);
        assert_eq!(cfg.thresholds, [0.5, 0.6, 0.8]);
        assert_eq!(cfg.scale_factor, DEFAULT_SCALE_FACTOR);
    }

    #[test]
    fn test_generate_boxes_maps_cells_to_source() {
        let map = ScoreMap {
            width: 2,
            height: 2,
            scores: vec![0.1, 0.9, 0.2, 0.3],
            regressions: vec![[0.0; 4], [0.1, 0.2, 0.3, 0.4], [0.0; 4], [0.0; 4]],
        };
        let boxes = generate_boxes(&map, 0.5, 0.6);
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        // cell (1, 0): window [2, 14) × [0, 12) at scale 0.5
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (4.0, 0.0, 28.0, 24.0));
        assert_eq!(b.regression, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(b.score, 0.9);
    }

    #[test]
    fn test_generate_boxes_skips_nan() {
        let map = ScoreMap {
            width: 2,
            height: 1,
            scores: vec![f32::NAN, 0.9],
            regressions: vec![[0.0; 4]; 2],
        };
        let boxes = generate_boxes(&map, 1.0, 0.6);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].score, 0.9);
    }

    #[test]
    fn test_rescore_maps_landmarks() {
        let candidates = vec![BoundingBox::new(10.0, 20.0, 30.0, 40.0, 0.9)];
        let out = StageOutput {
            scores: vec![0.95],
            regressions: vec![[0.0; 4]],
            landmarks: Some(vec![[0.0, 1.0, 0.5, 0.25, 0.75, 0.0, 0.0, 0.5, 1.0, 1.0]]),
        };
        let kept = rescore(&candidates, &out, 0.7);
        let lm = kept[0].landmarks.unwrap();
        assert_eq!(lm[0], (10.0, 20.0));
        assert_eq!(lm[1], (30.0, 20.0));
        assert_eq!(lm[2], (20.0, 30.0));
        assert_eq!(kept[0].score, 0.95);
    }

    #[test]
    fn test_blank_image_yields_no_faces() {
        let blank = RgbImage::new(64, 64);
        let faces = detector().detect(&blank).unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_image_below_min_face_yields_no_faces() {
        let tiny = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
        assert!(detector().detect(&tiny).unwrap().is_empty());
    }

    #[test]
    fn test_synthetic_face_detected() {
        let image = mock::face_image(64, 64, 16, 16, 32, Rgb([255, 0, 0]));
        let faces = detector().detect(&image).unwrap();
        assert!(!faces.is_empty());

        for face in &faces {
            assert!(face.is_valid());
            assert!(face.x1 >= 0.0 && face.y1 >= 0.0);
            assert!(face.x2 <= 64.0 && face.y2 <= 64.0);
            assert!(face.score >= 0.7);
            let cx = (face.x1 + face.x2) / 2.0;
            let cy = (face.y1 + face.y2) / 2.0;
            assert!((16.0..=48.0).contains(&cx), "centre x {cx} outside face");
            assert!((16.0..=48.0).contains(&cy), "centre y {cy} outside face");
            assert!(face.landmarks.is_some());
        }
    }

    #[test]
    fn test_cascade_monotonic() {
        let images = [
            mock::face_image(64, 64, 16, 16, 32, Rgb([255, 0, 0])),
            mock::face_image(80, 60, 5, 10, 40, Rgb([0, 255, 0])),
            mock::face_image(50, 50, 30, 30, 20, Rgb([200, 200, 200])),
            RgbImage::new(40, 40),
        ];
        let det = detector();
        for image in &images {
            let trace = det.trace(image).unwrap();
            assert!(trace.proposals.len() >= trace.refined.len());
            assert!(trace.refined.len() >= trace.faces.len());
        }
    }

    #[test]
    fn test_proposals_are_square() {
        let image = mock::face_image(64, 64, 16, 16, 32, Rgb([255, 255, 255]));
        let trace = detector().trace(&image).unwrap();
        assert!(!trace.proposals.is_empty());
        for b in trace.proposals.iter().chain(trace.refined.iter()) {
            assert!((b.width() - b.height()).abs() <= 1.0);
        }
    }

    #[test]
    fn test_proposal_failure_is_not_empty_result() {
        let det = FaceDetector::new(
            Box::new(FailingProposal),
            Box::new(BrightnessStage::new(24)),
            Box::new(BrightnessStage::new(48)),
            DetectorConfig::default(),
        )
        .unwrap();
        let err = det.detect(&RgbImage::new(64, 64)).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Inference {
                stage: Stage::Proposal,
                ..
            }
        ));
    }

    #[test]
    fn test_refinement_failure_aborts() {
        let det = FaceDetector::new(
            Box::new(BrightnessProposal),
            Box::new(FailingStage::new(24)),
            Box::new(BrightnessStage::new(48)),
            DetectorConfig::default(),
        )
        .unwrap();
        let image = mock::face_image(64, 64, 16, 16, 32, Rgb([255, 0, 0]));
        let err = det.detect(&image).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Inference {
                stage: Stage::Refinement,
                ..
            }
        ));
        assert!(err.to_string().starts_with("refinement stage failed"));
    }

    #[test]
    fn test_malformed_output_rejected() {
        let det = FaceDetector::new(
            Box::new(BrightnessProposal),
            Box::new(BrightnessStage::new(24)),
            Box::new(BrightnessStage::truncated(48)),
            DetectorConfig::default(),
        )
        .unwrap();
        let image = mock::face_image(64, 64, 16, 16, 32, Rgb([255, 0, 0]));
        let err = det.detect(&image).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Inference {
                stage: Stage::Output,
                source: InferenceError::MalformedOutput(_),
            }
        ));
    }

    fn detector_with(
        proposal: impl ProposalNetwork + 'static,
        refinement: BrightnessStage,
        output: BrightnessStage,
    ) -> FaceDetector {
        FaceDetector::new(
            Box::new(proposal),
            Box::new(refinement),
            Box::new(output),
            DetectorConfig::default(),
        )
        .unwrap()
    }

    fn near(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_unbounded_proposal_delta_is_error() {
        let det = detector_with(
            FixedProposal::new(0.9, [0.0, 0.0, 1e6, 1e6]),
            BrightnessStage::new(24),
            BrightnessStage::new(48),
        );
        let err = det.detect(&RgbImage::new(64, 64)).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Inference {
                stage: Stage::Proposal,
                source: InferenceError::MalformedOutput(_),
            }
        ));
    }

    #[test]
    fn test_unbounded_stage_delta_is_error() {
        let det = detector_with(
            BrightnessProposal,
            BrightnessStage::with_deltas(24, [0.0, 0.0, 1e6, 1e6]),
            BrightnessStage::new(48),
        );
        let image = mock::face_image(64, 64, 16, 16, 32, Rgb([255, 0, 0]));
        assert!(matches!(
            det.detect(&image),
            Err(DetectorError::Inference {
                stage: Stage::Refinement,
                ..
            })
        ));
    }

    #[test]
    fn test_large_boxes_past_the_image_still_crop() {
        // Maximal in-range growth: each box leaves the image by far.
        let det = detector_with(
            FixedProposal::new(0.9, [-9.0, -9.0, 9.0, 9.0]),
            BrightnessStage::new(24),
            BrightnessStage::new(48),
        );
        let image = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let trace = det.trace(&image).unwrap();
        assert!(!trace.proposals.is_empty());
        for face in &trace.faces {
            assert!(face.x1 >= 0.0 && face.x2 <= 64.0);
        }
    }

    #[test]
    fn test_proposal_regression_applied() {
        let image = mock::face_image(64, 64, 16, 16, 32, Rgb([255, 255, 255]));
        let plain = detector().trace(&image).unwrap();
        let shifted = detector_with(
            ShiftedProposal([0.1, 0.1, 0.1, 0.1]),
            BrightnessStage::new(24),
            BrightnessStage::new(48),
        )
        .trace(&image)
        .unwrap();

        // Candidates and their NMS order do not depend on the deltas.
        assert!(!plain.proposals.is_empty());
        assert_eq!(plain.proposals.len(), shifted.proposals.len());
        for (p, s) in plain.proposals.iter().zip(&shifted.proposals) {
            assert!(near(s.x1, p.x1 + 0.1 * p.width(), 1.5), "{s:?} vs {p:?}");
            assert!(near(s.y1, p.y1 + 0.1 * p.height(), 1.5), "{s:?} vs {p:?}");
            assert!(near(s.width(), p.width(), 2.0));
        }
    }

    #[test]
    fn test_stage_regression_applied() {
        let image = mock::face_image(96, 96, 24, 24, 40, Rgb([255, 255, 255]));
        let trace = detector_with(
            BrightnessProposal,
            BrightnessStage::with_deltas(24, [0.1, 0.1, 0.1, 0.1]),
            BrightnessStage::with_deltas(48, [-0.05, -0.05, 0.05, 0.05]),
        )
        .trace(&image)
        .unwrap();
        assert!(!trace.refined.is_empty());
        assert!(!trace.faces.is_empty());

        // Refined boxes are proposals shifted by a tenth of their side, re-squared.
        for r in &trace.refined {
            assert!(near(r.width(), r.height(), 1.0));
            assert!(
                trace.proposals.iter().any(|p| {
                    near(r.x1, p.x1 + 0.1 * p.width(), 1.5)
                        && near(r.y1, p.y1 + 0.1 * p.height(), 1.5)
                        && near(r.width(), p.width(), 2.0)
                }),
                "refined box {r:?} matches no shifted proposal"
            );
        }

        // Faces are refined boxes grown by 5% per side, then clipped.
        for f in &trace.faces {
            assert!(
                trace.refined.iter().any(|r| {
                    let (gx, gy) = (0.05 * r.width(), 0.05 * r.height());
                    let grown = BoundingBox::new(r.x1 - gx, r.y1 - gy, r.x2 + gx, r.y2 + gy, 0.0)
                        .clip(96, 96);
                    near(f.x1, grown.x1, 1e-3)
                        && near(f.y1, grown.y1, 1e-3)
                        && near(f.x2, grown.x2, 1e-3)
                        && near(f.y2, grown.y2, 1e-3)
                }),
                "face {f:?} matches no grown refined box"
            );
        }
    }
}
