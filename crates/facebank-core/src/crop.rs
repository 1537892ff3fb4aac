//! Face region extraction, resampling and tensor conversion.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

// Pixel normalisation shared by every network: (p - 127.5) / 128 → [-1, 1).
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;

/// Whole-pixel box `[x0, x1) × [y0, y1)` enclosing `bbox`.
///
/// Coordinates are limited to two image sizes beyond each edge, which bounds
/// every canvas built from the box.
fn snap(image: &RgbImage, bbox: &BoundingBox) -> (i64, i64, i64, i64) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = (bbox.x1.floor() as i64).clamp(-2 * w, 3 * w);
    let y0 = (bbox.y1.floor() as i64).clamp(-2 * h, 3 * h);
    let x1 = (bbox.x2.ceil() as i64).clamp(-2 * w, 3 * w);
    let y1 = (bbox.y2.ceil() as i64).clamp(-2 * h, 3 * h);
    (x0, y0, x1.max(x0 + 1), y1.max(y0 + 1))
}

/// Part of the snapped box inside the image, if any.
fn visible(image: &RgbImage, (x0, y0, x1, y1): (i64, i64, i64, i64)) -> Option<(u32, u32, u32, u32)> {
    let sx0 = x0.clamp(0, image.width() as i64);
    let sy0 = y0.clamp(0, image.height() as i64);
    let sx1 = x1.clamp(0, image.width() as i64);
    let sy1 = y1.clamp(0, image.height() as i64);
    (sx1 > sx0 && sy1 > sy0).then(|| {
        (
            sx0 as u32,
            sy0 as u32,
            (sx1 - sx0) as u32,
            (sy1 - sy0) as u32,
        )
    })
}

/// Extract the pixels under `bbox` at native resolution.
///
/// The box is snapped outward to whole pixels. Parts of the box that lie
/// outside the image are zero-filled, so the crop has the box's size as long
/// as the box stays within two image sizes of the image.
pub fn crop_region(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let snapped @ (x0, y0, x1, y1) = snap(image, bbox);
    let mut canvas = RgbImage::new((x1 - x0) as u32, (y1 - y0) as u32);

    if let Some((sx, sy, w, h)) = visible(image, snapped) {
        let pixels = imageops::crop_imm(image, sx, sy, w, h).to_image();
        imageops::replace(&mut canvas, &pixels, sx as i64 - x0, sy as i64 - y0);
    }

    canvas
}

/// Resample an image to exactly `width × height` (bilinear).
pub fn resample(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Crop `bbox` out of `image` and resample it to `size × size`.
///
/// Only the visible part of the box is resampled, straight into its place on
/// the output; memory use does not depend on the box size.
pub fn crop_resized(image: &RgbImage, bbox: &BoundingBox, size: u32) -> RgbImage {
    let mut canvas = RgbImage::new(size, size);
    let (iw, ih) = (image.width() as f64, image.height() as f64);

    let x0 = f64::from(bbox.x1).floor();
    let y0 = f64::from(bbox.y1).floor();
    let x1 = f64::from(bbox.x2).ceil().max(x0 + 1.0);
    let y1 = f64::from(bbox.y2).ceil().max(y0 + 1.0);

    let (sx0, sy0) = (x0.clamp(0.0, iw), y0.clamp(0.0, ih));
    let (sx1, sy1) = (x1.clamp(0.0, iw), y1.clamp(0.0, ih));
    if !(sx1 > sx0 && sy1 > sy0) {
        return canvas;
    }

    let kx = f64::from(size) / (x1 - x0);
    let ky = f64::from(size) / (y1 - y0);
    let left = ((sx0 - x0) * kx).round();
    let top = ((sy0 - y0) * ky).round();
    let out_w = ((sx1 - x0) * kx).round() - left;
    let out_h = ((sy1 - y0) * ky).round() - top;
    let out_w = out_w.clamp(1.0, f64::from(size)) as u32;
    let out_h = out_h.clamp(1.0, f64::from(size)) as u32;

    let pixels = imageops::crop_imm(
        image,
        sx0 as u32,
        sy0 as u32,
        (sx1 - sx0) as u32,
        (sy1 - sy0) as u32,
    )
    .to_image();
    imageops::replace(
        &mut canvas,
        &resample(&pixels, out_w, out_h),
        left as i64,
        top as i64,
    );
    canvas
}

/// Convert one image into a normalised 1×3×H×W tensor.
pub fn image_to_tensor(image: &RgbImage) -> Array4<f32> {
    batch_to_tensor(std::slice::from_ref(image))
}

/// Stack equally-sized images into a normalised N×3×H×W tensor.
///
/// All images must share the first image's dimensions; smaller images are
/// zero-padded (after normalisation, i.e. to the value of a black pixel).
pub fn batch_to_tensor(images: &[RgbImage]) -> Array4<f32> {
    let (w, h) = images.first().map(RgbImage::dimensions).unwrap_or((0, 0));
    let black = (0.0 - PIXEL_MEAN) / PIXEL_STD;

    Array4::from_shape_fn(
        (images.len(), 3, h as usize, w as usize),
        |(n, c, y, x)| match images[n].get_pixel_checked(x as u32, y as u32) {
            Some(pixel) => (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD,
            None => black,
        },
    )
}
