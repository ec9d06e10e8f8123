//! sRGB ⇄ CIE Lab (D65) conversion on planar `f32` channels.

use image::{Rgb, RgbImage};
use ndarray::Array2;

// sRGB/Rec.709 primaries, D65 white.
const RGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412453, 0.357580, 0.180423],
    [0.212671, 0.715160, 0.072169],
    [0.019334, 0.119193, 0.950227],
];

const XYZ_TO_RGB: [[f32; 3]; 3] = [
    [3.240479, -1.537150, -0.498535],
    [-0.969256, 1.875991, 0.041556],
    [0.055648, -0.204043, 1.057311],
];

const X_N: f32 = 0.950456;
const Z_N: f32 = 1.088754;

// (6/29)^3
const EPSILON: f32 = 0.008856;
const KAPPA_INV: f32 = 7.787;
// lab_f(EPSILON)
const F_EPSILON: f32 = 0.206893;

/// Range of the chroma channels once quantized back to 8 bits.
pub const CHROMA_MIN: f32 = -128.0;
pub const CHROMA_MAX: f32 = 127.0;

#[inline]
pub fn srgb_to_linear(srgb: f32) -> f32 {
    if srgb <= 0.04045 {
        srgb / 12.92
    } else {
        ((srgb + 0.055) / 1.055).powf(2.4)
    }
}

#[inline]
pub fn linear_to_srgb(linear: f32) -> f32 {
    if linear <= 0.04045 / 12.92 {
        linear * 12.92
    } else {
        1.055 * linear.max(0.0).powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn lab_f(t: f32) -> f32 {
    if t > EPSILON {
        t.cbrt()
    } else {
        KAPPA_INV * t + 16.0 / 116.0
    }
}

#[inline]
fn lab_f_inv(t: f32) -> f32 {
    if t > F_EPSILON {
        t * t * t
    } else {
        (t - 16.0 / 116.0) / KAPPA_INV
    }
}

/// Linear RGB (0–1) to Lab; L in 0–100, a/b roughly ±127.
#[inline]
pub fn linear_rgb_to_lab(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let x = (RGB_TO_XYZ[0][0] * r + RGB_TO_XYZ[0][1] * g + RGB_TO_XYZ[0][2] * b) / X_N;
    let y = RGB_TO_XYZ[1][0] * r + RGB_TO_XYZ[1][1] * g + RGB_TO_XYZ[1][2] * b;
    let z = (RGB_TO_XYZ[2][0] * r + RGB_TO_XYZ[2][1] * g + RGB_TO_XYZ[2][2] * b) / Z_N;

    let fx = lab_f(x);
    let fy = lab_f(y);
    let fz = lab_f(z);

    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

#[inline]
pub fn lab_to_linear_rgb(l: f32, a: f32, b: f32) -> (f32, f32, f32) {
    let fy = (l + 16.0) / 116.0;
    let fx = a / 500.0 + fy;
    let fz = fy - b / 200.0;

    let x = lab_f_inv(fx) * X_N;
    let y = lab_f_inv(fy);
    let z = lab_f_inv(fz) * Z_N;

    (
        XYZ_TO_RGB[0][0] * x + XYZ_TO_RGB[0][1] * y + XYZ_TO_RGB[0][2] * z,
        XYZ_TO_RGB[1][0] * x + XYZ_TO_RGB[1][1] * y + XYZ_TO_RGB[1][2] * z,
        XYZ_TO_RGB[2][0] * x + XYZ_TO_RGB[2][1] * y + XYZ_TO_RGB[2][2] * z,
    )
}

/// Planar Lab image. `l` is luminance, `a`/`b` are chrominance.
#[derive(Debug, Clone, PartialEq)]
pub struct LabImage {
    pub l: Array2<f32>,
    pub a: Array2<f32>,
    pub b: Array2<f32>,
}

impl LabImage {
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let lut: Vec<f32> = (0..=255u8)
            .map(|v| srgb_to_linear(f32::from(v) / 255.0))
            .collect();

        let mut l = Array2::zeros((h, w));
        let mut a = Array2::zeros((h, w));
        let mut b = Array2::zeros((h, w));
        for (x, y, pixel) in image.enumerate_pixels() {
            let [r, g, bl] = pixel.0;
            let lab = linear_rgb_to_lab(lut[r as usize], lut[g as usize], lut[bl as usize]);
            let idx = [y as usize, x as usize];
            l[idx] = lab.0;
            a[idx] = lab.1;
            b[idx] = lab.2;
        }
        Self { l, a, b }
    }

    /// Back to 8-bit sRGB. Out-of-gamut values are clipped.
    pub fn to_rgb(&self) -> RgbImage {
        let (h, w) = self.dim();
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let idx = [y as usize, x as usize];
            let (r, g, b) = lab_to_linear_rgb(self.l[idx], self.a[idx], self.b[idx]);
            Rgb([quantize(r), quantize(g), quantize(b)])
        })
    }

    /// `(height, width)`
    pub fn dim(&self) -> (usize, usize) {
        self.l.dim()
    }
}

fn quantize(linear: f32) -> u8 {
    (linear_to_srgb(linear.clamp(0.0, 1.0)) * 255.0)
        .round()
        .clamp(0.0, 255.0) as u8
}
