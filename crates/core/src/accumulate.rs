//! Weighted reconstruction of a full image from overlapping tile outputs.
//!
//! Every tile adds `tile * weight` to `result` and `weight` to `weight_sum`;
//! dividing the two at the end blends overlaps with the kernel falloff.

use anyhow::{bail, ensure, Result};
use image::{imageops, Rgb, RgbImage};
use ndarray::{s, Array2, Array3, ArrayView2};
use tracing::debug;

use crate::kernel::WeightKernel;
use crate::resample::resize_rgb;
use crate::tiling::{TileGeometry, TileWindow};

/// Target for per-tile diagnostics.
pub const TILE_LOG_TARGET: &str = "tilerefine::tiles";

/// Float accumulators for one reconstruction. `result` is H×W×3,
/// `weight_sum` is H×W.
#[derive(Debug, Clone)]
pub struct Canvas {
    result: Array3<f32>,
    weight_sum: Array2<f32>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        Self {
            result: Array3::zeros((h, w, 3)),
            weight_sum: Array2::zeros((h, w)),
        }
    }

    pub fn width(&self) -> usize {
        self.weight_sum.ncols()
    }

    pub fn height(&self) -> usize {
        self.weight_sum.nrows()
    }

    pub fn weight_sum(&self) -> ArrayView2<'_, f32> {
        self.weight_sum.view()
    }

    /// Add `tile` weighted by `weights` at `window`. The tile and weights
    /// must both match the window size.
    pub fn accumulate(
        &mut self,
        window: &TileWindow,
        tile: &RgbImage,
        weights: &ArrayView2<'_, f32>,
    ) -> Result<()> {
        let (w, h) = (window.width() as usize, window.height() as usize);
        ensure!(
            tile.dimensions() == (window.width(), window.height()),
            "tile is {}x{} but window is {w}x{h}",
            tile.width(),
            tile.height()
        );
        ensure!(
            weights.dim() == (h, w),
            "weights are {:?} but window is {w}x{h}",
            weights.dim()
        );
        ensure!(
            window.right as usize <= self.width() && window.bottom as usize <= self.height(),
            "window {window:?} exceeds canvas {}x{}",
            self.width(),
            self.height()
        );

        let (top, left) = (window.top as usize, window.left as usize);
        let mut result = self
            .result
            .slice_mut(s![top..top + h, left..left + w, ..]);
        let mut weight_sum = self.weight_sum.slice_mut(s![top..top + h, left..left + w]);

        for (x, y, pixel) in tile.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let weight = weights[[y, x]];
            for c in 0..3 {
                result[[y, x, c]] += f32::from(pixel.0[c]) * weight;
            }
            weight_sum[[y, x]] += weight;
        }
        Ok(())
    }

    /// Normalize into an 8-bit image. Fails if any pixel was never covered.
    pub fn finalize(self) -> Result<RgbImage> {
        let uncovered = self.weight_sum.iter().filter(|&&w| w <= 0.0).count();
        ensure!(
            uncovered == 0,
            "{uncovered} pixels have no accumulated weight"
        );

        let (h, w) = self.weight_sum.dim();
        let mut out = RgbImage::new(w as u32, h as u32);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let (xu, yu) = (x as usize, y as usize);
            let weight = self.weight_sum[[yu, xu]];
            let mut rgb = [0u8; 3];
            for (c, value) in rgb.iter_mut().enumerate() {
                *value = (self.result[[yu, xu, c]] / weight).round().clamp(0.0, 255.0) as u8;
            }
            *pixel = Rgb(rgb);
        }
        Ok(out)
    }
}

/// Run every tile of `geometry` through `process` in row-major order and
/// blend the outputs.
///
/// `process` receives the window and the crop already resampled to
/// `tile_width`×`tile_height`. Edge tiles whose window is smaller get their
/// output and the kernel resampled down to the window; full tiles use the
/// kernel slice directly.
pub fn reconstruct<F>(
    image: &RgbImage,
    geometry: &TileGeometry,
    kernel: &WeightKernel,
    mut process: F,
) -> Result<RgbImage>
where
    F: FnMut(&TileWindow, &RgbImage) -> Result<RgbImage>,
{
    if image.dimensions() != (geometry.image_width, geometry.image_height) {
        bail!(
            "image is {}x{} but geometry was computed for {}x{}",
            image.width(),
            image.height(),
            geometry.image_width,
            geometry.image_height
        );
    }
    ensure!(
        kernel.size() >= geometry.kernel_size() as usize,
        "kernel size {} is smaller than tile size {}",
        kernel.size(),
        geometry.kernel_size()
    );

    let mut canvas = Canvas::new(geometry.image_width, geometry.image_height);
    for window in geometry.windows() {
        debug!(
            target: TILE_LOG_TARGET,
            row = window.row,
            col = window.col,
            left = window.left,
            top = window.top,
            right = window.right,
            bottom = window.bottom,
            "processing tile"
        );

        let crop = imageops::crop_imm(
            image,
            window.left,
            window.top,
            window.width(),
            window.height(),
        )
        .to_image();
        let input = resize_rgb(&crop, geometry.tile_width, geometry.tile_height);
        let output = process(&window, &input)?;

        let clamped = (window.width(), window.height())
            != (geometry.tile_width, geometry.tile_height);
        let tile = resize_rgb(&output, window.width(), window.height());
        let weights = kernel.for_region(
            window.height() as usize,
            window.width() as usize,
            clamped,
        );
        canvas.accumulate(&window, &tile, &weights.view())?;
    }

    canvas.finalize()
}
