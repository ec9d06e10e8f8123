use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use tracing::debug;
use uuid::Uuid;

/// Decode any supported image and coerce it to 8-bit RGB.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to decode image {}", path.display()))?;
    debug!(
        path = %path.display(),
        color = ?decoded.color(),
        width = decoded.width(),
        height = decoded.height(),
        "Loaded input image"
    );
    Ok(decoded.to_rgb8())
}

/// Write `image` as `upscaled-<uuid>.png` under `output_dir`.
pub fn save_image(image: &RgbImage, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    let path = output_dir.join(format!("upscaled-{}.png", Uuid::new_v4()));
    image
        .save_with_format(&path, ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
