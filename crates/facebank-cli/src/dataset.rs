//! Labelled dataset loading: `<root>/<label>/<image>`.

use anyhow::{bail, Context, Result};
use facebank_core::recognizer::LabeledSample;
use image::RgbImage;
use std::path::Path;
use walkdir::WalkDir;

/// Decode one image file to RGB.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    Ok(image.to_rgb8())
}

/// Every decodable image two levels below `root`, labelled by its parent
/// directory. Files that fail to decode are logged and skipped.
pub fn load_samples(root: &Path) -> Result<Vec<LabeledSample>> {
    if !root.is_dir() {
        bail!("dataset {} is not a directory", root.display());
    }

    let mut samples = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(label) = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
        else {
            continue;
        };

        match load_image(path) {
            Ok(image) => samples.push(LabeledSample {
                label,
                source: path.display().to_string(),
                image,
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "skipping sample"),
        }
    }

    tracing::info!(root = %root.display(), samples = samples.len(), "dataset loaded");
    Ok(samples)
}
