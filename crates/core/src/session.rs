//! ONNX Runtime session construction for the pre-upscaler.
//!
//! The execution target is the only hardware binding in the crate; it comes
//! from configuration and is handed to [`build_session`].

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Where the upscaler network runs.
///
/// `Tensorrt` registers CUDA as a fallback; `Cuda` lets ORT fall back to CPU
/// when no GPU is present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl ExecutionTarget {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub target: ExecutionTarget,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Files and bytes under a TensorRT engine cache directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub file_count: u64,
    pub total_bytes: u64,
}

pub fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    stats.file_count += 1;
                    stats.total_bytes += meta.len();
                }
            }
        }
    }

    stats
}

/// Build an `ort::Session` for `config.model_path` on the requested target.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    if !config.model_path.is_file() {
        bail!("ONNX model not found: {}", config.model_path.display());
    }

    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.target {
        ExecutionTarget::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let before = cache_stats(cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            let session = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?;

            let after = cache_stats(cache_dir);
            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                cache_updated = after != before,
                "TensorRT session ready"
            );
            session
        }
        ExecutionTarget::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(target_ep = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        ExecutionTarget::Cpu => {
            debug!(target_ep = "cpu", "Building session with CPU EP");
            builder
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_from_str_lossy() {
        assert_eq!(ExecutionTarget::from_str_lossy("CUDA"), ExecutionTarget::Cuda);
        assert_eq!(ExecutionTarget::from_str_lossy("TensorRT"), ExecutionTarget::Tensorrt);
        assert_eq!(ExecutionTarget::from_str_lossy("trt"), ExecutionTarget::Tensorrt);
        assert_eq!(ExecutionTarget::from_str_lossy("cpu"), ExecutionTarget::Cpu);
        assert_eq!(ExecutionTarget::from_str_lossy(""), ExecutionTarget::Cuda);
    }

    #[test]
    fn target_display_matches_serde_names() {
        for target in [ExecutionTarget::Cuda, ExecutionTarget::Tensorrt, ExecutionTarget::Cpu] {
            let json = serde_json::to_string(&target).unwrap();
            assert_eq!(json, format!("\"{target}\""));
        }
    }

    #[test]
    fn cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("engines")).unwrap();
        std::fs::write(dir.path().join("a.bin"), b"1234").unwrap();
        std::fs::write(dir.path().join("engines/b.bin"), b"56").unwrap();

        let stats = cache_stats(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 6);
    }

    #[test]
    fn cache_stats_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cache_stats(&dir.path().join("nope")), CacheStats::default());
    }

    #[test]
    fn missing_model_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.onnx");
        let err = build_session(&SessionConfig {
            model_path: &path,
            target: ExecutionTarget::Cpu,
            trt_cache_dir: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
