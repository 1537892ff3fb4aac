//! Non-Maximum Suppression over candidate face boxes.

use crate::types::BoundingBox;
use serde::{Deserialize, Serialize};

/// How the intersection of two boxes is normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NmsMode {
    /// Intersection over union.
    Union,
    /// Intersection over the smaller of the two areas. Suppresses boxes
    /// nested inside a larger one that IoU would keep.
    Min,
}

/// Overlap ratio between two boxes under the given mode, in [0, 1].
pub fn overlap(a: &BoundingBox, b: &BoundingBox, mode: NmsMode) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);

    let denom = match mode {
        NmsMode::Union => a.area() + b.area() - inter_area,
        NmsMode::Min => a.area().min(b.area()),
    };

    if denom > 0.0 {
        inter_area / denom
    } else {
        0.0
    }
}

/// Keep the highest-scoring box of every cluster whose overlap exceeds `threshold`.
///
/// Output is sorted by descending score. Equal scores keep their input order,
/// so the earlier box wins a tie.
pub fn nms(mut boxes: Vec<BoundingBox>, threshold: f32, mode: NmsMode) -> Vec<BoundingBox> {
    // sort_by is stable: ties keep input order.
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && overlap(&boxes[i], &boxes[j], mode) > threshold {
                suppressed[j] = true;
            }
        }
    }

    boxes
        .into_iter()
        .zip(suppressed)
        .filter_map(|(b, dropped)| (!dropped).then_some(b))
        .collect()
}
