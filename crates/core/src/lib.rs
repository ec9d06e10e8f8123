//! Tile-based image refinement: pre-upscale an image, split it into
//! overlapping tiles, run each tile through a generative model and blend the
//! results back with Gaussian weights, then restore the original colors in
//! the wavelet domain.

pub mod accumulate;
pub mod catalog;
pub mod color;
pub mod color_transfer;
pub mod config;
pub mod error;
pub mod hdr;
pub mod http_backend;
pub mod image_io;
pub mod kernel;
pub mod logging;
pub mod pipeline;
pub mod pyramid;
pub mod resample;
pub mod runtime;
pub mod session;
pub mod tile_model;
pub mod tiling;
pub mod upscaler;
pub mod wavelet;
