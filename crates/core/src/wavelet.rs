//! Multi-level 2-D Haar wavelet decomposition.
//!
//! Odd extents are extended by repeating the last sample, and every level
//! remembers its input shape so reconstruction crops back exactly.

use std::f32::consts::FRAC_1_SQRT_2;

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

/// Detail coefficients of one level plus the shape of that level's input.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailLevel {
    pub horizontal: Array2<f32>,
    pub vertical: Array2<f32>,
    pub diagonal: Array2<f32>,
    shape: (usize, usize),
}

/// `approx` is the coarsest approximation; `details` run from the coarsest
/// level to the finest.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub approx: Array2<f32>,
    pub details: Vec<DetailLevel>,
}

impl Decomposition {
    pub fn levels(&self) -> usize {
        self.details.len()
    }
}

/// Deepest useful level for a `height`×`width` plane: `floor(log2(min))`.
pub fn max_level(height: usize, width: usize) -> usize {
    let shortest = height.min(width);
    if shortest == 0 {
        0
    } else {
        shortest.ilog2() as usize
    }
}

/// Decompose `data` into at most `levels` levels. The depth is capped at
/// [`max_level`].
pub fn wavedec2(data: &ArrayView2<'_, f32>, levels: usize) -> Result<Decomposition> {
    let (h, w) = data.dim();
    ensure!(h > 0 && w > 0, "cannot decompose an empty {h}x{w} plane");

    let levels = levels.min(max_level(h, w));
    let mut approx = data.to_owned();
    let mut details = Vec::with_capacity(levels);
    for _ in 0..levels {
        let shape = approx.dim();
        let (low, high) = analyze_columns(&approx.view());
        let (ll, lh) = analyze_rows(&low.view());
        let (hl, hh) = analyze_rows(&high.view());
        details.push(DetailLevel {
            horizontal: lh,
            vertical: hl,
            diagonal: hh,
            shape,
        });
        approx = ll;
    }
    details.reverse();

    Ok(Decomposition { approx, details })
}

/// Inverse of [`wavedec2`].
pub fn waverec2(decomposition: &Decomposition) -> Result<Array2<f32>> {
    let mut approx = decomposition.approx.clone();
    for level in &decomposition.details {
        ensure!(
            approx.dim() == level.horizontal.dim(),
            "approximation {:?} does not match detail {:?}",
            approx.dim(),
            level.horizontal.dim()
        );
        let (h, w) = level.shape;
        let low = synthesize_rows(&approx.view(), &level.horizontal.view(), h);
        let high = synthesize_rows(&level.vertical.view(), &level.diagonal.view(), h);
        approx = synthesize_columns(&low.view(), &high.view(), w);
    }
    Ok(approx)
}

/// Haar step along the last axis (within each row).
fn analyze_columns(x: &ArrayView2<'_, f32>) -> (Array2<f32>, Array2<f32>) {
    let (rows, n) = x.dim();
    let half = n.div_ceil(2);
    let mut low = Array2::zeros((rows, half));
    let mut high = Array2::zeros((rows, half));
    for r in 0..rows {
        for k in 0..half {
            let a = x[[r, 2 * k]];
            let b = x[[r, (2 * k + 1).min(n - 1)]];
            low[[r, k]] = (a + b) * FRAC_1_SQRT_2;
            high[[r, k]] = (a - b) * FRAC_1_SQRT_2;
        }
    }
    (low, high)
}

/// Haar step along the first axis.
fn analyze_rows(x: &ArrayView2<'_, f32>) -> (Array2<f32>, Array2<f32>) {
    let (low, high) = analyze_columns(&x.t());
    (low.reversed_axes(), high.reversed_axes())
}

fn synthesize_columns(low: &ArrayView2<'_, f32>, high: &ArrayView2<'_, f32>, n: usize) -> Array2<f32> {
    let rows = low.nrows();
    let mut out = Array2::zeros((rows, n));
    for r in 0..rows {
        for k in 0..low.ncols() {
            let (lo, hi) = (low[[r, k]], high[[r, k]]);
            if 2 * k < n {
                out[[r, 2 * k]] = (lo + hi) * FRAC_1_SQRT_2;
            }
            if 2 * k + 1 < n {
                out[[r, 2 * k + 1]] = (lo - hi) * FRAC_1_SQRT_2;
            }
        }
    }
    out
}

fn synthesize_rows(low: &ArrayView2<'_, f32>, high: &ArrayView2<'_, f32>, n: usize) -> Array2<f32> {
    synthesize_columns(&low.t(), &high.t(), n).reversed_axes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> Array2<f32> {
        Array2::from_shape_fn((h, w), |(y, x)| ((y * 31 + x * 17) % 97) as f32 - 40.0)
    }

    fn max_abs_diff(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn reconstruction_is_lossless_for_odd_and_even_shapes() {
        for (h, w) in [(8, 8), (7, 5), (33, 64), (1, 9), (2, 3), (100, 61)] {
            let data = ramp(h, w);
            let dec = wavedec2(&data.view(), 2).unwrap();
            let back = waverec2(&dec).unwrap();
            assert_eq!(back.dim(), (h, w));
            assert!(max_abs_diff(&data, &back) < 1e-3, "{h}x{w}");
        }
    }

    #[test]
    fn two_levels_quarter_each_axis() {
        let dec = wavedec2(&ramp(64, 40).view(), 2).unwrap();
        assert_eq!(dec.levels(), 2);
        assert_eq!(dec.approx.dim(), (16, 10));
        assert_eq!(dec.details[0].horizontal.dim(), (16, 10));
        assert_eq!(dec.details[1].diagonal.dim(), (32, 20));
    }

    #[test]
    fn depth_is_capped_by_the_short_side() {
        assert_eq!(max_level(1, 100), 0);
        assert_eq!(max_level(3, 100), 1);
        assert_eq!(max_level(4, 4), 2);
        let dec = wavedec2(&ramp(3, 50).view(), 5).unwrap();
        assert_eq!(dec.levels(), 1);
    }

    #[test]
    fn constant_plane_has_no_detail() {
        let data = Array2::from_elem((12, 10), 3.5f32);
        let dec = wavedec2(&data.view(), 2).unwrap();
        for level in &dec.details {
            assert!(level.horizontal.iter().all(|v| v.abs() < 1e-5));
            assert!(level.vertical.iter().all(|v| v.abs() < 1e-5));
            assert!(level.diagonal.iter().all(|v| v.abs() < 1e-5));
        }
        // Two orthonormal Haar levels scale a constant by 2 per level.
        assert!(dec.approx.iter().all(|v| (v - 14.0).abs() < 1e-4));
    }

    #[test]
    fn empty_plane_is_rejected() {
        let data = Array2::<f32>::zeros((0, 4));
        assert!(wavedec2(&data.view(), 2).is_err());
    }

    #[test]
    fn mismatched_approx_is_rejected() {
        let mut dec = wavedec2(&ramp(16, 16).view(), 2).unwrap();
        dec.approx = Array2::zeros((3, 3));
        assert!(waverec2(&dec).is_err());
    }
}
