//! Stage attribution for prediction failures.
//!
//! Every pipeline step wraps its error in a [`StageError`] so callers can
//! `downcast_ref::<StageError>()` on the returned `anyhow::Error` and learn
//! which step aborted the prediction.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Load,
    Upscale,
    ToneMap,
    Refine,
    ColorCorrection,
    Save,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Upscale => write!(f, "upscale"),
            Self::ToneMap => write!(f, "tone-map"),
            Self::Refine => write!(f, "refine"),
            Self::ColorCorrection => write!(f, "color-correction"),
            Self::Save => write!(f, "save"),
        }
    }
}

#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: Stage, source: anyhow::Error) -> Self {
        Self { stage, source }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed", self.stage)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Attach a [`Stage`] to any fallible step.
pub trait StageResultExt<T> {
    fn in_stage(self, stage: Stage) -> anyhow::Result<T>;
}

impl<T> StageResultExt<T> for anyhow::Result<T> {
    fn in_stage(self, stage: Stage) -> anyhow::Result<T> {
        self.map_err(|source| StageError::new(stage, source).into())
    }
}

/// The stage that failed, if `error` came out of the pipeline.
pub fn failed_stage(error: &anyhow::Error) -> Option<Stage> {
    error.downcast_ref::<StageError>().map(|e| e.stage)
}
