//! Wavelet-domain color fidelity correction.
//!
//! The generated image keeps its luminance and its fine chroma detail; the
//! coarsest chroma approximation is taken from the reference image instead.

use anyhow::{ensure, Context, Result};
use image::RgbImage;
use ndarray::{Array2, ArrayView2};
use tracing::{debug, warn};

use crate::color::{LabImage, CHROMA_MAX, CHROMA_MIN};
use crate::resample::resize_rgb;
use crate::wavelet::{wavedec2, waverec2};

pub const DEFAULT_WAVELET_LEVELS: usize = 2;

/// Replace the coarsest wavelet approximation of `generated` with that of
/// `reference`, keeping every detail level of `generated`.
pub fn replace_coarse(
    reference: &ArrayView2<'_, f32>,
    generated: &ArrayView2<'_, f32>,
    levels: usize,
) -> Result<Array2<f32>> {
    ensure!(
        reference.dim() == generated.dim(),
        "reference plane {:?} and generated plane {:?} differ in size",
        reference.dim(),
        generated.dim()
    );
    let coarse = wavedec2(reference, levels)?.approx;
    let mut decomposition = wavedec2(generated, levels)?;
    decomposition.approx = coarse;
    waverec2(&decomposition)
}

/// Transfer the reference's chroma onto `generated`. `l` is copied through
/// untouched; `a` and `b` are clipped to the 8-bit chroma range.
pub fn transfer_chroma(reference: &LabImage, generated: &LabImage, levels: usize) -> Result<LabImage> {
    let a = replace_coarse(&reference.a.view(), &generated.a.view(), levels)
        .context("a channel")?
        .mapv(|v| v.clamp(CHROMA_MIN, CHROMA_MAX));
    let b = replace_coarse(&reference.b.view(), &generated.b.view(), levels)
        .context("b channel")?
        .mapv(|v| v.clamp(CHROMA_MIN, CHROMA_MAX));

    Ok(LabImage {
        l: generated.l.clone(),
        a,
        b,
    })
}

/// RGB front end for [`transfer_chroma`]. A reference of a different size is
/// resampled to the generated image first.
pub fn wavelet_color_transfer(
    reference: &RgbImage,
    generated: &RgbImage,
    levels: usize,
) -> Result<RgbImage> {
    let reference = if reference.dimensions() != generated.dimensions() {
        warn!(
            reference = ?reference.dimensions(),
            generated = ?generated.dimensions(),
            "Color reference size differs from the refined image, resampling"
        );
        resize_rgb(reference, generated.width(), generated.height())
    } else {
        reference.clone()
    };

    debug!(levels, "Applying wavelet color transfer");
    let corrected = transfer_chroma(
        &LabImage::from_rgb(&reference),
        &LabImage::from_rgb(generated),
        levels,
    )?;
    Ok(corrected.to_rgb())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn textured(w: u32, h: u32, tint: [i16; 3]) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let base = ((x * 7 + y * 13) % 64) as i16 + 96;
            Rgb([
                (base + tint[0]).clamp(0, 255) as u8,
                (base + tint[1]).clamp(0, 255) as u8,
                (base + tint[2]).clamp(0, 255) as u8,
            ])
        })
    }

    fn mean_channel(plane: &Array2<f32>) -> f32 {
        plane.sum() / plane.len() as f32
    }

    #[test]
    fn luminance_is_untouched() {
        let reference = LabImage::from_rgb(&textured(40, 30, [60, 0, -40]));
        let generated = LabImage::from_rgb(&textured(40, 30, [-30, 20, 50]));
        let corrected = transfer_chroma(&reference, &generated, 2).unwrap();
        assert_eq!(corrected.l, generated.l);
    }

    #[test]
    fn global_color_cast_follows_the_reference() {
        let reference = LabImage::from_rgb(&textured(64, 64, [70, 0, -50]));
        let generated = LabImage::from_rgb(&textured(64, 64, [-50, 10, 70]));
        let corrected = transfer_chroma(&reference, &generated, 2).unwrap();

        let target_a = mean_channel(&reference.a);
        let drifted_a = mean_channel(&generated.a);
        let fixed_a = mean_channel(&corrected.a);
        assert!((fixed_a - target_a).abs() < (drifted_a - target_a).abs() / 4.0);

        let target_b = mean_channel(&reference.b);
        let fixed_b = mean_channel(&corrected.b);
        assert!((fixed_b - target_b).abs() < 2.0);
    }

    #[test]
    fn identical_inputs_are_a_fixed_point() {
        let image = textured(33, 17, [10, -5, 20]);
        let lab = LabImage::from_rgb(&image);
        let corrected = transfer_chroma(&lab, &lab, 2).unwrap();
        for (x, y) in corrected.a.iter().zip(lab.a.iter()) {
            assert!((x - y).abs() < 1e-3);
        }
    }

    #[test]
    fn chroma_is_clipped() {
        let mut reference = LabImage::from_rgb(&textured(16, 16, [0, 0, 0]));
        reference.a.fill(400.0);
        reference.b.fill(-400.0);
        let generated = LabImage::from_rgb(&textured(16, 16, [0, 0, 0]));
        let corrected = transfer_chroma(&reference, &generated, 2).unwrap();
        assert!(corrected.a.iter().all(|&v| v <= CHROMA_MAX));
        assert!(corrected.b.iter().all(|&v| v >= CHROMA_MIN));
    }

    #[test]
    fn rgb_transfer_keeps_size_and_resamples_reference() {
        let generated = textured(48, 32, [0, 0, 0]);
        let reference = textured(24, 16, [40, 0, 0]);
        let out = wavelet_color_transfer(&reference, &generated, 2).unwrap();
        assert_eq!(out.dimensions(), (48, 32));
    }

    #[test]
    fn mismatched_planes_are_rejected() {
        let a = Array2::<f32>::zeros((4, 4));
        let b = Array2::<f32>::zeros((4, 5));
        assert!(replace_coarse(&a.view(), &b.view(), 2).is_err());
    }
}
