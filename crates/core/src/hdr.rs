//! HDR tone fusion: synthetic exposure bracketing merged with Mertens
//! exposure fusion.

use anyhow::{bail, ensure, Result};
use image::{Rgb, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pyramid::{collapse, gaussian_pyramid, laplacian_3x3, laplacian_pyramid, max_pyramid_level};

/// Intensities at or below this leave the image untouched.
pub const HDR_THRESHOLD: f32 = 0.1;

const WELL_EXPOSED_SIGMA2: f32 = 0.08;
const WEIGHT_EPSILON: f32 = 1e-12;

/// Exponents of the three quality measures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MertensWeights {
    pub contrast: f32,
    pub saturation: f32,
    pub exposure: f32,
}

impl Default for MertensWeights {
    fn default() -> Self {
        Self {
            contrast: 1.0,
            saturation: 1.0,
            exposure: 0.0,
        }
    }
}

/// Gain factors of the nine synthetic exposures, darkest first.
pub fn exposure_factors(intensity: f32) -> [f32; 9] {
    let h = intensity;
    [
        1.0 - 0.9 * h,
        1.0 - 0.7 * h,
        1.0 - 0.45 * h,
        1.0 - 0.25 * h,
        1.0,
        1.0 + 0.2 * h,
        1.0 + 0.4 * h,
        1.0 + 0.6 * h,
        1.0 + 0.8 * h,
    ]
}

/// `|v · gain|`, rounded and saturated to 8 bits.
pub fn scale_abs(image: &RgbImage, gain: f32) -> RgbImage {
    let mut out = image.clone();
    for value in out.iter_mut() {
        *value = (f32::from(*value) * gain).abs().round().min(255.0) as u8;
    }
    out
}

/// Tone-map `image` at `intensity`. Returns an exact copy when
/// `intensity <= HDR_THRESHOLD`.
pub fn apply_hdr(image: &RgbImage, intensity: f32) -> Result<RgbImage> {
    ensure!(
        intensity.is_finite(),
        "HDR intensity must be finite, got {intensity}"
    );
    if intensity <= HDR_THRESHOLD {
        return Ok(image.clone());
    }

    let exposures: Vec<RgbImage> = exposure_factors(intensity)
        .iter()
        .map(|&gain| scale_abs(image, gain))
        .collect();
    debug!(intensity, exposures = exposures.len(), "Fusing exposure bracket");

    let fused = merge_mertens(&exposures, &MertensWeights::default())?;
    Ok(quantize(&fused))
}

/// Mertens exposure fusion. Returns planar RGB in roughly `[0, 1]`.
pub fn merge_mertens(images: &[RgbImage], params: &MertensWeights) -> Result<[Array2<f32>; 3]> {
    let Some(first) = images.first() else {
        bail!("exposure fusion needs at least one image");
    };
    let (w, h) = first.dimensions();
    ensure!(w > 0 && h > 0, "cannot fuse empty images");
    ensure!(
        images.iter().all(|img| img.dimensions() == (w, h)),
        "exposure images differ in size"
    );
    let (h, w) = (h as usize, w as usize);

    let mut weights: Vec<Array2<f32>> = images.iter().map(|img| quality(img, params)).collect();
    let mut total = Array2::<f32>::zeros((h, w));
    for weight in &weights {
        total += weight;
    }
    for weight in &mut weights {
        *weight /= &total;
    }

    let max_level = max_pyramid_level(h, w);
    let mut blended: [Vec<Array2<f32>>; 3] = Default::default();
    for (image, weight) in images.iter().zip(weights) {
        let weight_pyr = gaussian_pyramid(weight, max_level);
        for (c, acc) in blended.iter_mut().enumerate() {
            let mut band = laplacian_pyramid(channel(image, c), max_level);
            for (level, w) in band.iter_mut().zip(&weight_pyr) {
                *level *= w;
            }
            if acc.is_empty() {
                *acc = band;
            } else {
                for (sum, level) in acc.iter_mut().zip(&band) {
                    *sum += level;
                }
            }
        }
    }

    let [r, g, b] = blended;
    Ok([collapse(r), collapse(g), collapse(b)])
}

/// Per-pixel weight: contrast · saturation · well-exposedness, each raised
/// to its exponent.
fn quality(image: &RgbImage, params: &MertensWeights) -> Array2<f32> {
    let (w, h) = image.dimensions();
    let mut gray = Array2::<f32>::zeros((h as usize, w as usize));
    let mut saturation = Array2::<f32>::zeros((h as usize, w as usize));
    let mut exposedness = Array2::<f32>::zeros((h as usize, w as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = [y as usize, x as usize];
        let [r, g, b] = pixel.0.map(|v| f32::from(v) / 255.0);
        gray[idx] = 0.299 * r + 0.587 * g + 0.114 * b;

        let mean = (r + g + b) / 3.0;
        saturation[idx] = ((r - mean).powi(2) + (g - mean).powi(2) + (b - mean).powi(2)).sqrt();

        exposedness[idx] = [r, g, b]
            .iter()
            .map(|c| (-(c - 0.5).powi(2) / WELL_EXPOSED_SIGMA2).exp())
            .product();
    }

    let mut weight = laplacian_3x3(&gray.view()).mapv(f32::abs);
    weight.zip_mut_with(&saturation, |c, &s| {
        *c = c.powf(params.contrast) * s.powf(params.saturation);
    });
    weight.zip_mut_with(&exposedness, |c, &e| {
        *c = *c * e.powf(params.exposure) + WEIGHT_EPSILON;
    });
    weight
}

fn channel(image: &RgbImage, c: usize) -> Array2<f32> {
    let (w, h) = image.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        f32::from(image.get_pixel(x as u32, y as u32).0[c]) / 255.0
    })
}

fn quantize(planes: &[Array2<f32>; 3]) -> RgbImage {
    let (h, w) = planes[0].dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let idx = [y as usize, x as usize];
        // Truncating cast after clipping.
        Rgb(planes
            .each_ref()
            .map(|plane| (plane[idx] * 255.0).clamp(0.0, 255.0) as u8))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                (x * 255 / (w - 1)) as u8,
                (y * 255 / (h - 1)) as u8,
                ((x * 3 + y * 5) % 256) as u8,
            ])
        })
    }

    #[test]
    fn low_intensity_is_bit_identical() {
        let image = gradient(37, 21);
        assert_eq!(apply_hdr(&image, 0.0).unwrap(), image);
        assert_eq!(apply_hdr(&image, HDR_THRESHOLD).unwrap(), image);
    }

    #[test]
    fn exposure_factors_bracket_unity() {
        let factors = exposure_factors(1.0);
        assert_eq!(factors[4], 1.0);
        assert!((factors[0] - 0.1).abs() < 1e-6);
        assert!((factors[8] - 1.8).abs() < 1e-6);
        assert!(factors.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn scale_abs_saturates_and_folds_negative_gain() {
        let image = RgbImage::from_pixel(2, 2, Rgb([100, 200, 10]));
        assert_eq!(scale_abs(&image, 2.0).get_pixel(0, 0).0, [200, 255, 20]);
        assert_eq!(scale_abs(&image, -0.5).get_pixel(1, 1).0, [50, 100, 5]);
    }

    #[test]
    fn flat_image_fuses_to_bracket_average() {
        // No contrast anywhere: every exposure gets the same weight, so the
        // fusion is the plain mean of the bracket.
        let image = RgbImage::from_pixel(16, 12, Rgb([100, 100, 100]));
        let out = apply_hdr(&image, 0.5).unwrap();
        assert_eq!(out.dimensions(), (16, 12));
        // (55 + 65 + 78 + 88 + 100 + 110 + 120 + 130 + 140) / 9 = 98.4
        assert!(out.pixels().all(|p| p.0 == [98, 98, 98]), "{:?}", out.get_pixel(0, 0));
    }

    #[test]
    fn textured_image_keeps_size_and_changes_tone() {
        let image = gradient(64, 48);
        let out = apply_hdr(&image, 1.0).unwrap();
        assert_eq!(out.dimensions(), image.dimensions());
        assert_ne!(out, image);
    }

    #[test]
    fn single_pixel_image_is_supported() {
        let image = RgbImage::from_pixel(1, 1, Rgb([30, 60, 90]));
        let out = apply_hdr(&image, 0.8).unwrap();
        assert_eq!(out.dimensions(), (1, 1));
    }

    #[test]
    fn fusion_rejects_mismatched_inputs() {
        let a = RgbImage::new(4, 4);
        let b = RgbImage::new(5, 4);
        assert!(merge_mertens(&[a, b], &MertensWeights::default()).is_err());
        assert!(merge_mertens(&[], &MertensWeights::default()).is_err());
    }

    #[test]
    fn non_finite_intensity_is_rejected() {
        let image = RgbImage::new(2, 2);
        assert!(apply_hdr(&image, f32::NAN).is_err());
    }
}
