use std::path::Path;

use anyhow::Result;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;
use tilerefine_core::config::AppConfig;
use tilerefine_core::error::{failed_stage, Stage};
use tilerefine_core::image_io::load_image;
use tilerefine_core::pipeline::{PredictRequest, Predictor, RefineOptions};
use tilerefine_core::tile_model::{IdentityTileModel, TileAdapter, TileModel, TileRequest};
use tilerefine_core::tiling::Partitioner;
use tilerefine_core::upscaler::{ResampleUpscaler, RESAMPLE_UPSCALER};

/// Brightens every tile a little.
#[derive(Default)]
struct Brighten;

impl TileModel for Brighten {
    fn process_tile(&mut self, tile: &RgbImage, _request: &TileRequest) -> Result<RgbImage> {
        let mut out = tile.clone();
        for value in out.iter_mut() {
            *value = value.saturating_add(10);
        }
        Ok(out)
    }
}

fn config_with_tile(size: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.tiling.fixed_tile_size = size;
    config.refine.upscaler = "resample".into();
    config
}

fn predictor<M: TileModel>(config: &AppConfig, data_dir: &Path, model: M) -> Predictor<M> {
    let adapter = TileAdapter::with_rng(model, config.adapter_options(), StdRng::seed_from_u64(11));
    Predictor::new(config, data_dir, adapter)
        .expect("predictor")
        .with_upscaler("resample", Box::new(ResampleUpscaler))
}

fn gradient(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| {
        Rgb([
            (x * 255 / (w - 1)) as u8,
            (y * 255 / (h - 1)) as u8,
            128,
        ])
    })
}

#[test]
fn large_image_geometry_matches_reference_scenario() {
    let geometry = Partitioner::default().partition(2000, 1500, false);
    assert_eq!((geometry.tile_width, geometry.overlap), (1024, 64));
    assert_eq!((geometry.tiles_x, geometry.tiles_y), (3, 2));
    assert_eq!(geometry.total_tiles(), 6);

    let windows: Vec<_> = geometry.windows().collect();
    assert_eq!(windows.last().map(|w| (w.right, w.bottom)), Some((2000, 1500)));
    assert!(windows.iter().all(|w| w.right <= 2000 && w.bottom <= 1500));
}

#[test]
fn end_to_end_prediction_writes_refined_png() {
    let data_dir = tempdir().expect("tempdir");
    let input = data_dir.path().join("input.png");
    gradient(100, 70).save(&input).expect("write input");

    let config = config_with_tile(96);
    let mut predictor = predictor(&config, data_dir.path(), Brighten);
    let mut request = PredictRequest::from_config(&input, &config.refine);
    request.refine.color_correction = false;

    let output = predictor.predict(&request).expect("prediction");
    assert_eq!((output.width, output.height), (200, 140));
    // tile 96, overlap 12: ceil(188 / 84) x ceil(128 / 84)
    assert_eq!(output.tiles, 3 * 2);

    let written = load_image(&output.path).expect("read output");
    assert_eq!(written.dimensions(), (200, 140));
    let corner = written.get_pixel(0, 0).0;
    assert_eq!(corner[2], 138, "brightened blue channel: {corner:?}");
}

#[test]
fn identity_model_with_everything_enabled_stays_close_to_input() {
    let data_dir = tempdir().expect("tempdir");
    let config = config_with_tile(64);
    let mut predictor = predictor(&config, data_dir.path(), IdentityTileModel);
    let image = gradient(120, 90);

    let refined = predictor
        .refine_image(
            &image,
            &RefineOptions {
                steps: 20,
                denoise: 0.6,
                guidance_scale: 3.0,
                hdr: 0.0,
                color_correction: true,
                adaptive_tiling: false,
            },
        )
        .expect("refine");

    assert_eq!(refined.image.dimensions(), image.dimensions());
    let max_diff = refined
        .image
        .as_raw()
        .iter()
        .zip(image.as_raw())
        .map(|(a, b)| a.abs_diff(*b))
        .max()
        .unwrap_or(0);
    assert!(max_diff <= 6, "max channel difference {max_diff}");
}

#[test]
fn hdr_changes_tones_before_tiling() {
    let data_dir = tempdir().expect("tempdir");
    let config = config_with_tile(64);
    let mut predictor = predictor(&config, data_dir.path(), IdentityTileModel);
    let image = gradient(80, 60);

    let options = RefineOptions {
        steps: 4,
        denoise: 1.0,
        guidance_scale: 0.0,
        hdr: 0.0,
        color_correction: false,
        adaptive_tiling: false,
    };
    let plain = predictor.refine_image(&image, &options).expect("plain");
    let toned = predictor
        .refine_image(&image, &RefineOptions { hdr: 1.0, ..options })
        .expect("toned");

    assert_ne!(plain.image, toned.image);
    assert_eq!(toned.image.dimensions(), image.dimensions());
}

#[test]
fn overlapping_tiles_blend_to_uniform_result() {
    let data_dir = tempdir().expect("tempdir");
    let config = config_with_tile(64);
    let mut predictor = predictor(&config, data_dir.path(), Brighten);
    let image = RgbImage::from_pixel(200, 120, Rgb([50, 60, 70]));

    let options = RefineOptions {
        steps: 4,
        denoise: 1.0,
        guidance_scale: 3.0,
        hdr: 0.0,
        color_correction: false,
        adaptive_tiling: false,
    };
    let refined = predictor.refine_image(&image, &options).expect("refine");
    assert!(refined.geometry.total_tiles() >= 4);
    assert!(refined.image.pixels().all(|p| p.0 == [60, 70, 80]));
}

#[test]
fn failures_name_the_stage() {
    let data_dir = tempdir().expect("tempdir");
    let config = config_with_tile(64);
    let mut predictor = predictor(&config, data_dir.path(), IdentityTileModel);

    let request = PredictRequest::from_config(data_dir.path().join("nope.png"), &config.refine);
    let err = predictor.predict(&request).expect_err("missing input");
    assert_eq!(failed_stage(&err), Some(Stage::Load));
    assert!(format!("{err:#}").contains("nope.png"));
}

#[test]
fn resample_upscaler_resolves_without_injection() {
    let data_dir = tempdir().expect("tempdir");
    let input = data_dir.path().join("input.png");
    RgbImage::from_pixel(40, 30, Rgb([20, 40, 60]))
        .save(&input)
        .expect("write input");

    let mut config = config_with_tile(64);
    config.refine.upscaler = RESAMPLE_UPSCALER.into();
    let adapter = TileAdapter::with_rng(IdentityTileModel, config.adapter_options(), StdRng::seed_from_u64(3));
    let mut predictor = Predictor::new(&config, data_dir.path(), adapter).expect("predictor");

    let mut request = PredictRequest::from_config(&input, &config.refine);
    request.refine.color_correction = false;
    let output = predictor.predict(&request).expect("prediction");

    assert_eq!((output.width, output.height), (80, 60));
    let written = load_image(&output.path).expect("read output");
    assert!(written.pixels().all(|p| p.0 == [20, 40, 60]));
}
