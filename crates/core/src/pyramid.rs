//! Gaussian / Laplacian pyramids on `f32` planes.
//!
//! Borders reflect without repeating the edge sample (`dcb|abcd|cba`), and
//! the 5-tap binomial kernel `[1 4 6 4 1] / 16` is applied separably.

use ndarray::{Array2, ArrayView2};

const TAPS: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

/// Mirror `i` into `0..n` without repeating the border sample.
pub fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * n as isize - 2;
    let i = i.rem_euclid(period);
    if i >= n as isize {
        (period - i) as usize
    } else {
        i as usize
    }
}

/// Blur and halve. Output is `((h + 1) / 2, (w + 1) / 2)`.
pub fn pyr_down(src: &ArrayView2<'_, f32>) -> Array2<f32> {
    let (h, w) = src.dim();
    let (dh, dw) = (h.div_ceil(2), w.div_ceil(2));

    // Horizontal pass at even columns.
    let mut rows = Array2::<f32>::zeros((h, dw));
    for y in 0..h {
        for x in 0..dw {
            let cx = 2 * x as isize;
            let mut acc = 0.0;
            for (k, tap) in TAPS.iter().enumerate() {
                acc += tap * src[[y, reflect101(cx + k as isize - 2, w)]];
            }
            rows[[y, x]] = acc / 16.0;
        }
    }

    // Vertical pass at even rows.
    let mut dst = Array2::<f32>::zeros((dh, dw));
    for y in 0..dh {
        let cy = 2 * y as isize;
        for x in 0..dw {
            let mut acc = 0.0;
            for (k, tap) in TAPS.iter().enumerate() {
                acc += tap * rows[[reflect101(cy + k as isize - 2, h), x]];
            }
            dst[[y, x]] = acc / 16.0;
        }
    }
    dst
}

/// Upsample to `(height, width)`: zero-insert, then blur with the kernel
/// scaled by four.
pub fn pyr_up(src: &ArrayView2<'_, f32>, height: usize, width: usize) -> Array2<f32> {
    let mut sparse = Array2::<f32>::zeros((height, width));
    for ((y, x), &v) in src.indexed_iter() {
        if 2 * y < height && 2 * x < width {
            sparse[[2 * y, 2 * x]] = v;
        }
    }

    let mut rows = Array2::<f32>::zeros((height, width));
    for y in (0..height).step_by(2) {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, tap) in TAPS.iter().enumerate() {
                acc += tap * sparse[[y, reflect101(x as isize + k as isize - 2, width)]];
            }
            rows[[y, x]] = acc / 8.0;
        }
    }

    let mut dst = Array2::<f32>::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, tap) in TAPS.iter().enumerate() {
                acc += tap * rows[[reflect101(y as isize + k as isize - 2, height), x]];
            }
            dst[[y, x]] = acc / 8.0;
        }
    }
    dst
}

/// Levels `0..=max_level`, finest first.
pub fn gaussian_pyramid(plane: Array2<f32>, max_level: usize) -> Vec<Array2<f32>> {
    let mut levels = Vec::with_capacity(max_level + 1);
    levels.push(plane);
    for _ in 0..max_level {
        let next = match levels.last() {
            Some(prev) => pyr_down(&prev.view()),
            None => break,
        };
        levels.push(next);
    }
    levels
}

/// Band-pass levels plus the coarsest Gaussian level as the residual.
pub fn laplacian_pyramid(plane: Array2<f32>, max_level: usize) -> Vec<Array2<f32>> {
    let mut levels = gaussian_pyramid(plane, max_level);
    for lvl in 0..levels.len().saturating_sub(1) {
        let (h, w) = levels[lvl].dim();
        let up = pyr_up(&levels[lvl + 1].view(), h, w);
        levels[lvl] -= &up;
    }
    levels
}

/// Inverse of [`laplacian_pyramid`].
pub fn collapse(mut levels: Vec<Array2<f32>>) -> Array2<f32> {
    while levels.len() > 1 {
        let Some(coarse) = levels.pop() else { break };
        let Some(finer) = levels.last_mut() else { break };
        let (h, w) = finer.dim();
        *finer += &pyr_up(&coarse.view(), h, w);
    }
    levels.pop().unwrap_or_else(|| Array2::zeros((0, 0)))
}

/// 4-neighbour Laplacian `[0 1 0; 1 -4 1; 0 1 0]`.
pub fn laplacian_3x3(src: &ArrayView2<'_, f32>) -> Array2<f32> {
    let (h, w) = src.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let (yi, xi) = (y as isize, x as isize);
        src[[reflect101(yi - 1, h), x]]
            + src[[reflect101(yi + 1, h), x]]
            + src[[y, reflect101(xi - 1, w)]]
            + src[[y, reflect101(xi + 1, w)]]
            - 4.0 * src[[y, x]]
    })
}

/// Number of pyramid levels below the base for a `height`×`width` image.
pub fn max_pyramid_level(height: usize, width: usize) -> usize {
    height.min(width).max(1).ilog2() as usize
}
