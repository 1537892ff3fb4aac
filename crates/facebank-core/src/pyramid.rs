//! Multi-scale image pyramid for the proposal stage.

use image::imageops::{self, FilterType};
use image::RgbImage;

/// Side of the square window one proposal cell covers.
pub const PROPOSAL_CELL_SIZE: u32 = 12;
/// Step between neighbouring proposal cells, in resized-image pixels.
pub const PROPOSAL_STRIDE: u32 = 2;

/// Lazy, finite sequence of pyramid scales `s_0 > s_1 > ...`.
///
/// `s_0` maps `min_face_size` onto one proposal cell; each following scale is
/// the previous one times `factor`. Iteration stops once the shorter image
/// side, scaled, would drop below the cell size.
#[derive(Debug, Clone)]
pub struct PyramidScales {
    scale: f32,
    factor: f32,
    min_side: f32,
}

impl PyramidScales {
    /// `factor` must lie in (0, 1) and `min_face_size` must be positive;
    /// otherwise the sequence is empty.
    pub fn new(width: u32, height: u32, min_face_size: u32, factor: f32) -> Self {
        let valid = min_face_size > 0 && factor > 0.0 && factor < 1.0;
        Self {
            scale: PROPOSAL_CELL_SIZE as f32 / min_face_size.max(1) as f32,
            factor,
            min_side: if valid { width.min(height) as f32 } else { 0.0 },
        }
    }
}

impl Iterator for PyramidScales {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.min_side * self.scale < PROPOSAL_CELL_SIZE as f32 {
            return None;
        }
        let current = self.scale;
        self.scale *= self.factor;
        Some(current)
    }
}

/// One pyramid level: the scale and the image resized by it.
pub struct PyramidLevel {
    pub scale: f32,
    pub image: RgbImage,
}

/// Size of `image` resized by `scale`, rounded up, never below one pixel.
pub fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = (width as f32 * scale).ceil().max(1.0) as u32;
    let h = (height as f32 * scale).ceil().max(1.0) as u32;
    (w, h)
}

/// Iterate the pyramid levels of `image`, resizing lazily per level.
pub fn pyramid<'a>(
    image: &'a RgbImage,
    min_face_size: u32,
    factor: f32,
) -> impl Iterator<Item = PyramidLevel> + 'a {
    PyramidScales::new(image.width(), image.height(), min_face_size, factor).map(move |scale| {
        let (w, h) = scaled_size(image.width(), image.height(), scale);
        PyramidLevel {
            scale,
            image: imageops::resize(image, w, h, FilterType::Triangle),
        }
    })
}
