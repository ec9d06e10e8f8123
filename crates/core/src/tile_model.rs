//! The generative model seen from the tiling pipeline: one fixed-size tile
//! in, one tile out.

use anyhow::{ensure, Context, Result};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::accumulate::TILE_LOG_TARGET;
use crate::resample::resize_rgb;

pub const DEFAULT_PROMPT: &str = "masterpiece, best quality, highres";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "low quality, normal quality, ugly, blurry, blur, \
lowres, bad anatomy, bad hands, cropped, worst quality";
pub const DEFAULT_CONDITIONING_SCALES: [f32; 2] = [1.0, 0.55];
pub const DEFAULT_CONTROL_GUIDANCE_END: [f32; 2] = [0.5, 1.0];
pub const DEFAULT_MAX_EFFECTIVE_STEPS: u32 = 200;

/// Seeds are drawn from `0..=MAX_SEED`.
pub const MAX_SEED: u64 = 2_147_483_647;

/// Everything the backend needs for one tile besides the pixels.
///
/// Both conditioning images are the tile itself; `conditioning_scales` and
/// `control_guidance_end` are given in that order (structure, inpaint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub strength: f32,
    pub guidance_scale: f32,
    pub conditioning_scales: [f32; 2],
    pub control_guidance_end: [f32; 2],
    pub seed: u64,
}

pub trait TileModel {
    fn process_tile(&mut self, tile: &RgbImage, request: &TileRequest) -> Result<RgbImage>;
}

impl<M: TileModel + ?Sized> TileModel for Box<M> {
    fn process_tile(&mut self, tile: &RgbImage, request: &TileRequest) -> Result<RgbImage> {
        (**self).process_tile(tile, request)
    }
}

/// Returns every tile unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTileModel;

impl TileModel for IdentityTileModel {
    fn process_tile(&mut self, tile: &RgbImage, _request: &TileRequest) -> Result<RgbImage> {
        Ok(tile.clone())
    }
}

/// Returns a solid tile of one color.
#[derive(Debug, Clone, Copy)]
pub struct ConstantTileModel {
    pub color: [u8; 3],
}

impl TileModel for ConstantTileModel {
    fn process_tile(&mut self, tile: &RgbImage, _request: &TileRequest) -> Result<RgbImage> {
        Ok(RgbImage::from_pixel(tile.width(), tile.height(), Rgb(self.color)))
    }
}

/// Fixed prompt pair and conditioning applied to every tile.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOptions {
    pub prompt: String,
    pub negative_prompt: String,
    pub conditioning_scales: [f32; 2],
    pub control_guidance_end: [f32; 2],
    pub max_effective_steps: u32,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.into(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.into(),
            conditioning_scales: DEFAULT_CONDITIONING_SCALES,
            control_guidance_end: DEFAULT_CONTROL_GUIDANCE_END,
            max_effective_steps: DEFAULT_MAX_EFFECTIVE_STEPS,
        }
    }
}

/// Sampler settings shared by all tiles of one prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub steps: u32,
    pub strength: f32,
    pub guidance_scale: f32,
}

/// `round(steps / strength)`, capped at `max`.
pub fn effective_steps(steps: u32, strength: f32, max: u32) -> Result<u32> {
    ensure!(
        strength > 0.0 && strength <= 1.0,
        "denoise strength must be in (0, 1], got {strength}"
    );
    let raw = (f64::from(steps) / f64::from(strength)).round();
    if raw > f64::from(max) {
        warn!(
            steps,
            strength,
            requested = raw,
            cap = max,
            "Effective step count capped"
        );
        return Ok(max);
    }
    Ok(raw as u32)
}

/// Drives a [`TileModel`] for one prediction.
///
/// Each call draws a fresh seed, so tiles are sampled independently.
pub struct TileAdapter<M> {
    model: M,
    options: AdapterOptions,
    rng: StdRng,
}

impl<M: TileModel> TileAdapter<M> {
    pub fn new(model: M, options: AdapterOptions) -> Self {
        Self::with_rng(model, options, StdRng::from_entropy())
    }

    pub fn with_rng(model: M, options: AdapterOptions, rng: StdRng) -> Self {
        Self {
            model,
            options,
            rng,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Process `tile` at `tile_width`×`tile_height` and return a result of
    /// exactly that size.
    pub fn process_tile(
        &mut self,
        tile: &RgbImage,
        tile_width: u32,
        tile_height: u32,
        params: &SamplingParams,
    ) -> Result<RgbImage> {
        let input = resize_rgb(tile, tile_width, tile_height);
        let request = TileRequest {
            prompt: self.options.prompt.clone(),
            negative_prompt: self.options.negative_prompt.clone(),
            steps: effective_steps(params.steps, params.strength, self.options.max_effective_steps)?,
            strength: params.strength,
            guidance_scale: params.guidance_scale,
            conditioning_scales: self.options.conditioning_scales,
            control_guidance_end: self.options.control_guidance_end,
            seed: self.rng.gen_range(0..=MAX_SEED),
        };
        debug!(target: TILE_LOG_TARGET, seed = request.seed, steps = request.steps, "tile request");

        let output = self
            .model
            .process_tile(&input, &request)
            .context("tile model failed")?;

        if output.dimensions() != (tile_width, tile_height) {
            warn!(
                expected_width = tile_width,
                expected_height = tile_height,
                actual_width = output.width(),
                actual_height = output.height(),
                "Tile model returned a wrongly sized tile, resampling"
            );
            return Ok(resize_rgb(&output, tile_width, tile_height));
        }
        Ok(output)
    }
}
