//! Pure-Rust bilinear resampling.
//!
//! Pixel centres are aligned (half-pixel offset), so resampling to the same
//! size is an exact copy.

use image::RgbImage;
use ndarray::{Array2, ArrayView2};

/// Bilinear resize of an RGB image. Dimensions of zero are bumped to one.
pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let width = width.max(1);
    let height = height.max(1);
    if image.dimensions() == (width, height) {
        return image.clone();
    }

    let (src_w, src_h) = image.dimensions();
    let data = resize_bilinear(
        image.as_raw(),
        src_w as usize,
        src_h as usize,
        width as usize,
        height as usize,
    );

    // Buffer length is width*height*3 by construction.
    RgbImage::from_raw(width, height, data).unwrap_or_else(|| RgbImage::new(width, height))
}

/// Bilinear interpolation resize for 8-bit RGB24 data.
fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];

    for dst_y in 0..dst_h {
        let (src_y0, src_y1, fy) = source_span(dst_y, src_h, dst_h);

        for dst_x in 0..dst_w {
            let (src_x0, src_x1, fx) = source_span(dst_x, src_w, dst_w);
            let di = (dst_y * dst_w + dst_x) * 3;

            for c in 0..3 {
                let p00 = src[(src_y0 * src_w + src_x0) * 3 + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * 3 + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * 3 + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * 3 + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

/// Bilinear resize of a single-channel float plane.
pub fn resize_plane_bilinear(src: &ArrayView2<'_, f32>, dst_h: usize, dst_w: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    if (src_h, src_w) == (dst_h, dst_w) {
        return src.to_owned();
    }

    let columns: Vec<(usize, usize, f64)> =
        (0..dst_w).map(|x| source_span(x, src_w, dst_w)).collect();

    let mut dst = Array2::<f32>::zeros((dst_h, dst_w));
    for dst_y in 0..dst_h {
        let (y0, y1, fy) = source_span(dst_y, src_h, dst_h);
        for (dst_x, &(x0, x1, fx)) in columns.iter().enumerate() {
            let top = src[[y0, x0]] as f64 * (1.0 - fx) + src[[y0, x1]] as f64 * fx;
            let bot = src[[y1, x0]] as f64 * (1.0 - fx) + src[[y1, x1]] as f64 * fx;
            dst[[dst_y, dst_x]] = (top * (1.0 - fy) + bot * fy) as f32;
        }
    }
    dst
}

/// Map a destination pixel centre to its two source neighbours and the
/// interpolation weight of the second one.
fn source_span(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f64) {
    let src_f = (dst as f64 + 0.5) * src_len as f64 / dst_len as f64 - 0.5;
    let i0 = (src_f.floor().max(0.0) as usize).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    let frac = (src_f - i0 as f64).clamp(0.0, 1.0);
    (i0, i1, frac)
}
