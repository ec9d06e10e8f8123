//! Gaussian blending weights for overlapping tiles.

use anyhow::{ensure, Result};
use ndarray::{s, Array2, ArrayView2};

use crate::resample::resize_plane_bilinear;

pub const DEFAULT_SIGMA: f32 = 0.3;

/// Square weight map, ≈1 at the centre and tapering towards the edges.
/// Every element is strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightKernel {
    weights: Array2<f32>,
}

impl WeightKernel {
    /// `K[y, x] = exp(-(x'² + y'²) / (2σ²))` with `x'`, `y'` spaced linearly
    /// over `[-1, 1]`.
    pub fn gaussian(size: usize, sigma: f32) -> Result<Self> {
        ensure!(size > 0, "kernel size must be positive");
        ensure!(
            sigma.is_finite() && sigma > 0.0,
            "kernel sigma must be a positive number, got {sigma}"
        );

        let axis = linspace(size);
        let denom = 2.0 * f64::from(sigma) * f64::from(sigma);
        // Far corners of a narrow kernel underflow f32; keep them positive.
        let floor = f64::from(f32::MIN_POSITIVE);
        let weights = Array2::from_shape_fn((size, size), |(y, x)| {
            let r2 = axis[x] * axis[x] + axis[y] * axis[y];
            (-r2 / denom).exp().max(floor) as f32
        });

        Ok(Self { weights })
    }

    /// All-ones kernel: plain averaging in overlaps.
    pub fn uniform(size: usize) -> Self {
        Self {
            weights: Array2::ones((size.max(1), size.max(1))),
        }
    }

    pub fn size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.weights.view()
    }

    /// Weights for a tile whose accumulated region is `height`×`width`.
    ///
    /// `resampled` tiles (clamped at the image edge) get the whole kernel
    /// resized to the region so its falloff shape is kept; full tiles take
    /// the top-left `height`×`width` slice as-is.
    pub fn for_region(&self, height: usize, width: usize, resampled: bool) -> Array2<f32> {
        if resampled {
            resize_plane_bilinear(&self.weights.view(), height, width)
        } else {
            let h = height.min(self.size());
            let w = width.min(self.size());
            self.weights.slice(s![..h, ..w]).to_owned()
        }
    }
}

fn linspace(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![-1.0];
    }
    let step = 2.0 / (n - 1) as f64;
    (0..n).map(|i| -1.0 + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_positive_for_all_sizes() {
        for size in [1, 2, 3, 8, 33, 128, 1024] {
            let kernel = WeightKernel::gaussian(size, DEFAULT_SIGMA).unwrap();
            assert_eq!(kernel.size(), size);
            assert!(kernel.view().iter().all(|&w| w > 0.0), "size {size}");
        }
    }

    #[test]
    fn narrow_kernel_stays_positive() {
        let kernel = WeightKernel::gaussian(64, 0.01).unwrap();
        assert!(kernel.view().iter().all(|&w| w > 0.0));
    }

    #[test]
    fn kernel_is_symmetric_and_peaks_in_centre() {
        let kernel = WeightKernel::gaussian(65, DEFAULT_SIGMA).unwrap();
        let k = kernel.view();
        assert!((k[[32, 32]] - 1.0).abs() < 1e-6);
        for y in 0..65 {
            for x in 0..65 {
                assert!((k[[y, x]] - k[[x, y]]).abs() < 1e-7);
                assert!((k[[y, x]] - k[[64 - y, x]]).abs() < 1e-7);
                assert!((k[[y, x]] - k[[y, 64 - x]]).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn kernel_is_non_increasing_from_centre() {
        let kernel = WeightKernel::gaussian(101, DEFAULT_SIGMA).unwrap();
        let k = kernel.view();
        for x in 50..100 {
            assert!(k[[50, x + 1]] <= k[[50, x]]);
            assert!(k[[x + 1, x + 1]] <= k[[x, x]]);
        }
        assert!(k[[0, 0]] < 1e-4);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(WeightKernel::gaussian(0, DEFAULT_SIGMA).is_err());
        assert!(WeightKernel::gaussian(16, 0.0).is_err());
        assert!(WeightKernel::gaussian(16, f32::NAN).is_err());
    }

    #[test]
    fn region_slice_and_resample() {
        let kernel = WeightKernel::gaussian(64, DEFAULT_SIGMA).unwrap();

        let sliced = kernel.for_region(64, 48, false);
        assert_eq!(sliced.dim(), (64, 48));
        assert_eq!(sliced[[10, 20]], kernel.view()[[10, 20]]);

        let resized = kernel.for_region(20, 30, true);
        assert_eq!(resized.dim(), (20, 30));
        assert!(resized.iter().all(|&w| w > 0.0));
        // Shape is preserved: centre heavier than the corner.
        assert!(resized[[10, 15]] > resized[[0, 0]]);
    }

    #[test]
    fn uniform_kernel_is_all_ones() {
        let kernel = WeightKernel::uniform(5);
        assert!(kernel.view().iter().all(|&w| w == 1.0));
    }
}
