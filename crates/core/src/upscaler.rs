//! Pre-upscaling before tiling: an ONNX super-resolution network, or plain
//! bilinear resampling when no network is available.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use image::RgbImage;
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info, warn};

use crate::catalog::{UpscalerCatalog, UpscalerEntry};
use crate::pyramid::reflect101;
use crate::resample::resize_rgb;
use crate::session::{build_session, ExecutionTarget, SessionConfig};

pub trait Upscaler {
    fn name(&self) -> &str;

    /// Return `image` scaled to [`target_size`] for `factor`.
    fn upscale(&mut self, image: &RgbImage, factor: f32) -> Result<RgbImage>;
}

/// `round(W·factor) × round(H·factor)`, at least 1×1.
pub fn target_size(width: u32, height: u32, factor: f32) -> Result<(u32, u32)> {
    ensure!(
        factor.is_finite() && factor > 0.0,
        "upscale factor must be a positive number, got {factor}"
    );
    let scale = |v: u32| ((f64::from(v) * f64::from(factor)).round() as u32).max(1);
    Ok((scale(width), scale(height)))
}

/// Name under which [`ResampleUpscaler`] can be requested.
pub const RESAMPLE_UPSCALER: &str = "resample";

/// Bilinear resampling stand-in.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResampleUpscaler;

impl Upscaler for ResampleUpscaler {
    fn name(&self) -> &str {
        RESAMPLE_UPSCALER
    }

    fn upscale(&mut self, image: &RgbImage, factor: f32) -> Result<RgbImage> {
        let (w, h) = target_size(image.width(), image.height(), factor)?;
        Ok(resize_rgb(image, w, h))
    }
}

/// Super-resolution network run through ONNX Runtime.
pub struct OnnxUpscaler {
    entry: UpscalerEntry,
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxUpscaler {
    pub fn load(
        entry: &UpscalerEntry,
        model_path: &Path,
        target: ExecutionTarget,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        info!(
            model = %entry.name,
            path = %model_path.display(),
            %target,
            "Loading ONNX upscaler"
        );
        let session = build_session(&SessionConfig {
            model_path,
            target,
            trt_cache_dir,
        })?;

        let input = session.inputs().first().context("model has no inputs")?;
        let output = session.outputs().first().context("model has no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            entry: entry.clone(),
            session,
            input_name,
            output_name,
            is_fp16,
        })
    }

    /// One pass through the network at its native scale.
    fn run_network(&mut self, image: &RgbImage) -> Result<RgbImage> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let range = self.entry.normalization_range.1;
        let align = self.entry.pad_align.max(1) as usize;

        let input = pad_nchw(&image_to_nchw(image, range / 255.0), align);
        let (padded_h, padded_w) = (input.shape()[2], input.shape()[3]);

        let output = if self.is_fp16 {
            let mut data = vec![f16::ZERO; input.len()];
            let src = input.as_standard_layout();
            let src = src.as_slice().context("input tensor is not contiguous")?;
            data.convert_from_f32_slice(src);
            let tensor = Tensor::from_array(ArrayD::from_shape_vec(input.shape().to_vec(), data)?)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            view.mapv(f16::to_f32)
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned()
        };
        let output = output.into_dimensionality::<Ix4>()?;

        let (out_h, out_w) = (output.shape()[2], output.shape()[3]);
        ensure!(
            out_h % padded_h == 0 && out_w % padded_w == 0 && out_h / padded_h == out_w / padded_w,
            "unexpected output shape {:?} for input {padded_h}x{padded_w}",
            output.shape()
        );
        let native = out_h / padded_h;
        if native as u32 != self.entry.scale {
            warn!(
                model = %self.entry.name,
                catalog_scale = self.entry.scale,
                actual_scale = native,
                "Network scale differs from catalog"
            );
        }

        let cropped = output.slice(s![.., .., ..h * native, ..w * native]).to_owned();
        nchw_to_image(&cropped, 255.0 / range)
    }
}

impl Upscaler for OnnxUpscaler {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn upscale(&mut self, image: &RgbImage, factor: f32) -> Result<RgbImage> {
        let (w, h) = target_size(image.width(), image.height(), factor)?;
        let native = self
            .run_network(image)
            .with_context(|| format!("upscaler {} failed", self.entry.name))?;
        Ok(resize_rgb(&native, w, h))
    }
}

/// Resolve `name` in the catalog and load its network. [`RESAMPLE_UPSCALER`]
/// needs no weights and always resolves.
///
/// Other unknown names are an error. Weights that are missing or fail to load are
/// logged and replaced by [`ResampleUpscaler`].
pub fn select_upscaler(
    catalog: &UpscalerCatalog,
    name: &str,
    target: ExecutionTarget,
    trt_cache_dir: Option<&Path>,
) -> Result<Box<dyn Upscaler>> {
    if name == RESAMPLE_UPSCALER {
        return Ok(Box::new(ResampleUpscaler));
    }
    let Some(entry) = catalog.get(name) else {
        let known: Vec<&str> = catalog
            .list()
            .iter()
            .map(|e| e.name.as_str())
            .chain([RESAMPLE_UPSCALER])
            .collect();
        bail!("unknown upscaler {name:?}; available: {}", known.join(", "));
    };
    let path = catalog.models_dir().join(&entry.filename);

    match OnnxUpscaler::load(entry, &path, target, trt_cache_dir) {
        Ok(upscaler) => Ok(Box::new(upscaler)),
        Err(error) => {
            warn!(
                model = %name,
                error = %format!("{error:#}"),
                "Upscaler weights unavailable, falling back to bilinear resampling"
            );
            Ok(Box::new(ResampleUpscaler))
        }
    }
}

/// Interleaved RGB → NCHW `[1,3,H,W]`, each sample multiplied by `scale`.
fn image_to_nchw(image: &RgbImage, scale: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        f32::from(image.get_pixel(x as u32, y as u32).0[c]) * scale
    })
}

/// NCHW `[1,3,H,W]` → RGB, each sample multiplied by `scale`, rounded and
/// clamped to 0–255.
fn nchw_to_image(arr: &Array4<f32>, scale: f32) -> Result<RgbImage> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    ensure!(arr.shape()[1] == 3, "expected 3 channels, got {}", arr.shape()[1]);
    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([0, 1, 2].map(|c| (arr[[0, c, y, x]] * scale).round().clamp(0.0, 255.0) as u8))
    }))
}

fn pad_amount(dim: usize, align: usize) -> usize {
    (align - (dim % align)) % align
}

/// Reflection-pad H and W up to multiples of `align`.
fn pad_nchw(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    let (pad_h, pad_w) = (pad_amount(h, align), pad_amount(w, align));
    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    Array4::from_shape_fn((1, 3, h + pad_h, w + pad_w), |(_, c, y, x)| {
        arr[[0, c, reflect101(y as isize, h), reflect101(x as isize, w)]]
    })
}
