use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_UPSCALER;
use crate::color_transfer::DEFAULT_WAVELET_LEVELS;
use crate::kernel::DEFAULT_SIGMA;
use crate::session::ExecutionTarget;
use crate::tile_model::{
    AdapterOptions, DEFAULT_CONDITIONING_SCALES, DEFAULT_CONTROL_GUIDANCE_END,
    DEFAULT_MAX_EFFECTIVE_STEPS, DEFAULT_NEGATIVE_PROMPT, DEFAULT_PROMPT,
};
use crate::tiling::FIXED_TILE_SIZE;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILEREFINE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub refine: RefineConfig,
    pub tiling: TilingConfig,
    pub backend: BackendConfig,
    pub upscaler: UpscalerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

/// Defaults for every prediction request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefineConfig {
    pub upscaler: String,
    pub upscale_by: f32,
    pub steps: u32,
    pub denoise: f32,
    pub hdr: f32,
    pub guidance_scale: f32,
    pub color_correction: bool,
    pub adaptive_tiling: bool,
    pub max_effective_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    pub fixed_tile_size: u32,
    pub adaptive_min_tile: u32,
    pub adaptive_max_tile: u32,
    pub kernel_sigma: f32,
    pub wavelet_levels: usize,
}

/// The generative model service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub conditioning_scales: [f32; 2],
    pub control_guidance_end: [f32; 2],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscalerConfig {
    pub execution: ExecutionTarget,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            upscaler: DEFAULT_UPSCALER.to_string(),
            upscale_by: 2.0,
            steps: 20,
            denoise: 1.0,
            hdr: 0.0,
            guidance_scale: 3.0,
            color_correction: true,
            adaptive_tiling: false,
            max_effective_steps: DEFAULT_MAX_EFFECTIVE_STEPS,
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            fixed_tile_size: FIXED_TILE_SIZE,
            adaptive_min_tile: 512,
            adaptive_max_tile: FIXED_TILE_SIZE,
            kernel_sigma: DEFAULT_SIGMA,
            wavelet_levels: DEFAULT_WAVELET_LEVELS,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:7860".to_string(),
            timeout_secs: 600,
            api_key: None,
            prompt: DEFAULT_PROMPT.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            conditioning_scales: DEFAULT_CONDITIONING_SCALES,
            control_guidance_end: DEFAULT_CONTROL_GUIDANCE_END,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Prompt pair and conditioning for the tile adapter.
    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            prompt: self.backend.prompt.clone(),
            negative_prompt: self.backend.negative_prompt.clone(),
            conditioning_scales: self.backend.conditioning_scales,
            control_guidance_end: self.backend.control_guidance_end,
            max_effective_steps: self.refine.max_effective_steps,
        }
    }

    /// Relative paths in `paths` resolved against `data_dir`.
    pub fn resolved_paths(&self, data_dir: &Path) -> PathsConfig {
        PathsConfig {
            models_dir: resolve_relative_to(data_dir, &self.paths.models_dir),
            output_dir: resolve_relative_to(data_dir, &self.paths.output_dir),
            trt_cache_dir: resolve_relative_to(data_dir, &self.paths.trt_cache_dir),
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILEREFINE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default config.toml unless one exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
