//! One prediction end to end: load, pre-upscale, tone map, tile refinement,
//! color correction, save.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use image::RgbImage;
use tracing::info;

use crate::accumulate::reconstruct;
use crate::catalog::UpscalerCatalog;
use crate::color_transfer::wavelet_color_transfer;
use crate::config::{AppConfig, RefineConfig};
use crate::error::{Stage, StageResultExt};
use crate::hdr::{apply_hdr, HDR_THRESHOLD};
use crate::image_io::{load_image, save_image};
use crate::kernel::WeightKernel;
use crate::session::ExecutionTarget;
use crate::tile_model::{SamplingParams, TileAdapter, TileModel};
use crate::tiling::{AdaptiveTilePolicy, Partitioner, TileGeometry};
use crate::upscaler::{select_upscaler, Upscaler};

/// Settings for the in-memory part of a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOptions {
    pub steps: u32,
    pub denoise: f32,
    pub guidance_scale: f32,
    pub hdr: f32,
    pub color_correction: bool,
    pub adaptive_tiling: bool,
}

impl RefineOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.steps >= 1, "steps must be at least 1");
        ensure!(
            self.denoise > 0.0 && self.denoise <= 1.0,
            "denoise must be in (0, 1], got {}",
            self.denoise
        );
        ensure!(
            self.guidance_scale.is_finite() && self.guidance_scale >= 0.0,
            "guidance_scale must be >= 0, got {}",
            self.guidance_scale
        );
        ensure!(
            self.hdr.is_finite() && self.hdr >= 0.0,
            "hdr must be >= 0, got {}",
            self.hdr
        );
        Ok(())
    }
}

impl From<&RefineConfig> for RefineOptions {
    fn from(config: &RefineConfig) -> Self {
        Self {
            steps: config.steps,
            denoise: config.denoise,
            guidance_scale: config.guidance_scale,
            hdr: config.hdr,
            color_correction: config.color_correction,
            adaptive_tiling: config.adaptive_tiling,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictRequest {
    pub input: PathBuf,
    pub upscaler: String,
    pub upscale_by: f32,
    pub refine: RefineOptions,
}

impl PredictRequest {
    /// A request for `input` with every setting taken from `config`.
    pub fn from_config(input: impl Into<PathBuf>, config: &RefineConfig) -> Self {
        Self {
            input: input.into(),
            upscaler: config.upscaler.clone(),
            upscale_by: config.upscale_by,
            refine: RefineOptions::from(config),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.upscale_by.is_finite() && self.upscale_by > 0.0,
            "upscale_by must be > 0, got {}",
            self.upscale_by
        );
        ensure!(!self.upscaler.trim().is_empty(), "upscaler name is empty");
        self.refine.validate()
    }
}

#[derive(Debug, Clone)]
pub struct PredictOutput {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub tiles: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RefineOutput {
    pub image: RgbImage,
    pub geometry: TileGeometry,
}

/// Owns the tile adapter and the loaded upscaler across predictions.
/// Canvas buffers live only for the duration of one call.
pub struct Predictor<M> {
    adapter: TileAdapter<M>,
    partitioner: Partitioner,
    kernel_sigma: f32,
    wavelet_levels: usize,
    catalog: UpscalerCatalog,
    execution: ExecutionTarget,
    trt_cache_dir: PathBuf,
    output_dir: PathBuf,
    upscaler: Option<(String, Box<dyn Upscaler>)>,
}

impl<M: TileModel> Predictor<M> {
    pub fn new(config: &AppConfig, data_dir: &Path, adapter: TileAdapter<M>) -> Result<Self> {
        let paths = config.resolved_paths(data_dir);
        let catalog = UpscalerCatalog::load(paths.models_dir.clone())?;
        let partitioner = Partitioner::new(config.tiling.fixed_tile_size).with_adaptive_policy(
            AdaptiveTilePolicy::new(config.tiling.adaptive_min_tile, config.tiling.adaptive_max_tile),
        );

        Ok(Self {
            adapter,
            partitioner,
            kernel_sigma: config.tiling.kernel_sigma,
            wavelet_levels: config.tiling.wavelet_levels,
            catalog,
            execution: config.upscaler.execution,
            trt_cache_dir: paths.trt_cache_dir,
            output_dir: paths.output_dir,
            upscaler: None,
        })
    }

    /// Use `upscaler` whenever a request names `name`.
    pub fn with_upscaler(mut self, name: impl Into<String>, upscaler: Box<dyn Upscaler>) -> Self {
        self.upscaler = Some((name.into(), upscaler));
        self
    }

    pub fn catalog(&self) -> &UpscalerCatalog {
        &self.catalog
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn predict(&mut self, request: &PredictRequest) -> Result<PredictOutput> {
        request.validate()?;
        let started = Instant::now();
        info!(input = %request.input.display(), "Starting prediction");

        let image = load_image(&request.input).in_stage(Stage::Load)?;
        let upscaled = self
            .upscale(&image, &request.upscaler, request.upscale_by)
            .in_stage(Stage::Upscale)?;
        let refined = self.refine_image(&upscaled, &request.refine)?;
        let path = save_image(&refined.image, &self.output_dir).in_stage(Stage::Save)?;

        let elapsed = started.elapsed();
        info!(
            path = %path.display(),
            width = refined.image.width(),
            height = refined.image.height(),
            tiles = refined.geometry.total_tiles(),
            elapsed_secs = elapsed.as_secs_f64(),
            "Prediction complete"
        );

        Ok(PredictOutput {
            path,
            width: refined.image.width(),
            height: refined.image.height(),
            tiles: refined.geometry.total_tiles(),
            elapsed,
        })
    }

    /// Tone map, tile-refine and color-correct an already upscaled image.
    pub fn refine_image(&mut self, image: &RgbImage, options: &RefineOptions) -> Result<RefineOutput> {
        options.validate()?;

        if options.hdr > HDR_THRESHOLD {
            info!(intensity = options.hdr, "Applying HDR tone fusion");
        }
        let toned = apply_hdr(image, options.hdr).in_stage(Stage::ToneMap)?;

        let (refined, geometry) = self.refine_tiles(&toned, options).in_stage(Stage::Refine)?;

        let image = if options.color_correction {
            wavelet_color_transfer(&toned, &refined, self.wavelet_levels)
                .in_stage(Stage::ColorCorrection)?
        } else {
            refined
        };

        Ok(RefineOutput { image, geometry })
    }

    fn upscale(&mut self, image: &RgbImage, name: &str, factor: f32) -> Result<RgbImage> {
        let upscaler = self.upscaler_named(name)?;
        info!(
            upscaler = upscaler.name(),
            factor,
            width = image.width(),
            height = image.height(),
            "Pre-upscaling"
        );
        upscaler.upscale(image, factor)
    }

    fn upscaler_named(&mut self, name: &str) -> Result<&mut Box<dyn Upscaler>> {
        let loaded = matches!(&self.upscaler, Some((current, _)) if current == name);
        if !loaded {
            let upscaler = select_upscaler(
                &self.catalog,
                name,
                self.execution,
                Some(self.trt_cache_dir.as_path()),
            )?;
            self.upscaler = Some((name.to_string(), upscaler));
        }
        self.upscaler
            .as_mut()
            .map(|(_, upscaler)| upscaler)
            .context("no upscaler loaded")
    }

    fn refine_tiles(
        &mut self,
        image: &RgbImage,
        options: &RefineOptions,
    ) -> Result<(RgbImage, TileGeometry)> {
        let geometry = self
            .partitioner
            .partition(image.width(), image.height(), options.adaptive_tiling);
        info!(
            width = geometry.image_width,
            height = geometry.image_height,
            tile_width = geometry.tile_width,
            tile_height = geometry.tile_height,
            overlap = geometry.overlap,
            tiles_x = geometry.tiles_x,
            tiles_y = geometry.tiles_y,
            total = geometry.total_tiles(),
            "Tile geometry"
        );

        let kernel = WeightKernel::gaussian(geometry.kernel_size() as usize, self.kernel_sigma)?;
        let params = SamplingParams {
            steps: options.steps,
            strength: options.denoise,
            guidance_scale: options.guidance_scale,
        };
        let (tile_width, tile_height) = (geometry.tile_width, geometry.tile_height);
        let adapter = &mut self.adapter;

        let refined = reconstruct(image, &geometry, &kernel, |window, tile| {
            adapter
                .process_tile(tile, tile_width, tile_height, &params)
                .with_context(|| format!("tile ({}, {})", window.row, window.col))
        })?;
        Ok((refined, geometry))
    }
}
