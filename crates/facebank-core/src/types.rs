use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Face bounding box in source-image pixel coordinates.
///
/// `regression` holds the deltas predicted by the most recent cascade stage;
/// they are consumed by [`calibrate`](Self::calibrate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    /// Regression deltas: [dx1, dy1, dx2, dy2], relative to box width/height.
    pub regression: [f32; 4],
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
            regression: [0.0; 4],
            landmarks: None,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area of the box; zero for degenerate boxes.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// True when the box has positive extent and finite coordinates.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// Apply the stored regression deltas, scaled by the current box size.
    pub fn calibrate(&self) -> Self {
        let w = self.width();
        let h = self.height();
        let [dx1, dy1, dx2, dy2] = self.regression;
        Self {
            x1: self.x1 + dx1 * w,
            y1: self.y1 + dy1 * h,
            x2: self.x2 + dx2 * w,
            y2: self.y2 + dy2 * h,
            ..self.clone()
        }
    }

    /// Expand the shorter side to match the longer one, keeping the centre.
    pub fn square(&self) -> Self {
        let w = self.width();
        let h = self.height();
        if w == h {
            return self.clone();
        }
        let side = w.max(h);
        let cx = self.x1 + w * 0.5;
        let cy = self.y1 + h * 0.5;
        Self {
            x1: cx - side * 0.5,
            y1: cy - side * 0.5,
            x2: cx + side * 0.5,
            y2: cy + side * 0.5,
            ..self.clone()
        }
    }

    /// Clip the box to `[0, width] × [0, height]`.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
            ..self.clone()
        }
    }

    /// Snap coordinates to whole pixels, as used for stage-to-stage crops.
    pub fn round(&self) -> Self {
        Self {
            x1: self.x1.round(),
            y1: self.y1.round(),
            x2: self.x2.round(),
            y2: self.y2.round(),
            ..self.clone()
        }
    }
}

/// Face embedding vector (typically 128- or 512-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar; 0 for zero vectors.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, aa, bb) = self
            .values
            .iter()
            .zip(&other.values)
            .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (a, b)| {
                (dot + a * b, aa + a * a, bb + b * b)
            });

        match aa.sqrt() * bb.sqrt() {
            denom if denom > 0.0 => dot / denom,
            _ => 0.0,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }
}

/// One face found by the detector: its crop, its box and, once extracted,
/// its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    crop: RgbImage,
    bbox: BoundingBox,
    embedding: Option<Embedding>,
}

impl DetectedFace {
    pub fn new(crop: RgbImage, bbox: BoundingBox) -> Self {
        Self {
            crop,
            bbox,
            embedding: None,
        }
    }

    pub fn crop(&self) -> &RgbImage {
        &self.crop
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }

    /// Attach the embedding. Only the first call succeeds; the rejected
    /// embedding is handed back.
    pub fn attach_embedding(&mut self, embedding: Embedding) -> Result<(), Embedding> {
        if self.embedding.is_some() {
            return Err(embedding);
        }
        self.embedding = Some(embedding);
        Ok(())
    }

    pub fn into_embedding(self) -> Option<Embedding> {
        self.embedding
    }
}

/// Faces detected in one source image, in detection order.
///
/// An empty face list is a normal outcome ("no face found").
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Where the image came from (path, URL or caller-chosen name).
    pub source: String,
    pub faces: Vec<DetectedFace>,
}

impl DetectionResult {
    pub fn new(source: impl Into<String>, faces: Vec<DetectedFace>) -> Self {
        Self {
            source: source.into(),
            faces,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    /// Embeddings of all faces that have one, in detection order.
    pub fn embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.faces.iter().filter_map(DetectedFace::embedding)
    }
}
