//! Pixel math shared by the detector bank and the enhancement filters.
//!
//! Everything here operates on plain byte buffers: grayscale planes are
//! `width * height` bytes, color buffers are interleaved RGB. Border pixels
//! are handled by clamping, matching the replicate behavior of the usual
//! convolution routines.

pub mod clahe;
pub mod flow;

use crate::frame::CHANNELS;

/// Convert interleaved RGB to a grayscale plane with standard luminance
/// weights (Rec. 601).
pub fn grayscale(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = width as usize * height as usize;
    debug_assert_eq!(rgb.len(), pixels * CHANNELS);
    let mut gray = Vec::with_capacity(pixels);
    for px in rgb.chunks_exact(CHANNELS) {
        let y = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
        gray.push((y / 1000) as u8);
    }
    gray
}

/// Full 256-bin intensity histogram of a grayscale plane.
pub fn histogram256(gray: &[u8]) -> [u32; 256] {
    let mut hist = [0u32; 256];
    for &p in gray {
        hist[p as usize] += 1;
    }
    hist
}

/// Mean intensity of a grayscale plane.
pub fn mean(gray: &[u8]) -> f64 {
    if gray.is_empty() {
        return 0.0;
    }
    let sum: u64 = gray.iter().map(|&p| p as u64).sum();
    sum as f64 / gray.len() as f64
}

/// Mean absolute per-pixel difference between two equally sized planes.
pub fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    let sum: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x as i64 - y as i64).unsigned_abs())
        .sum();
    sum as f64 / a.len() as f64
}

/// Variance of the discrete 3x3 Laplacian response over a grayscale plane.
///
/// Kernel: `[[0,1,0],[1,-4,1],[0,1,0]]`, replicate borders. The scalar is a
/// sharpness proxy: crisp edges produce a wide response distribution, a
/// defocused lens collapses it toward zero.
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> f64 {
    let w = width as usize;
    let h = height as usize;
    if w * h == 0 {
        return 0.0;
    }
    let at = |x: usize, y: usize| gray[y * w + x] as f64;
    let clamp = |v: isize, hi: usize| v.clamp(0, hi as isize - 1) as usize;

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let up = at(x, clamp(y as isize - 1, h));
            let down = at(x, clamp(y as isize + 1, h));
            let left = at(clamp(x as isize - 1, w), y);
            let right = at(clamp(x as isize + 1, w), y);
            let response = up + down + left + right - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }
    let n = (w * h) as f64;
    let mean = sum / n;
    sum_sq / n - mean * mean
}

/// Normalized 1-D Gaussian kernel of `2 * radius + 1` taps.
pub(crate) fn gaussian_kernel(radius: usize, sigma: f32) -> Vec<f32> {
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    let denom = 2.0 * sigma * sigma;
    for i in -(radius as i32)..=(radius as i32) {
        kernel.push((-(i * i) as f32 / denom).exp());
    }
    let total: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= total;
    }
    kernel
}

/// Separable Gaussian blur over an interleaved RGB buffer (5x5 window).
pub fn gaussian_blur_rgb(rgb: &[u8], width: u32, height: u32, sigma: f32) -> Vec<f32> {
    let kernel = gaussian_kernel(2, sigma);
    let w = width as usize;
    let h = height as usize;
    let row_len = w * CHANNELS;

    // Horizontal pass.
    let mut tmp = vec![0.0f32; rgb.len()];
    for y in 0..h {
        for x in 0..w {
            for c in 0..CHANNELS {
                let mut acc = 0.0f32;
                for (ki, &k) in kernel.iter().enumerate() {
                    let sx = (x as isize + ki as isize - 2).clamp(0, w as isize - 1) as usize;
                    acc += k * rgb[y * row_len + sx * CHANNELS + c] as f32;
                }
                tmp[y * row_len + x * CHANNELS + c] = acc;
            }
        }
    }

    // Vertical pass.
    let mut out = vec![0.0f32; rgb.len()];
    for y in 0..h {
        for x in 0..w {
            for c in 0..CHANNELS {
                let mut acc = 0.0f32;
                for (ki, &k) in kernel.iter().enumerate() {
                    let sy = (y as isize + ki as isize - 2).clamp(0, h as isize - 1) as usize;
                    acc += k * tmp[sy * row_len + x * CHANNELS + c];
                }
                out[y * row_len + x * CHANNELS + c] = acc;
            }
        }
    }
    out
}

/// Unsharp mask: `out = src + strength * (src - gaussian(src))`, clipped.
///
/// Gaussian window is 5x5 with sigma 1.0, the shape the blur-correction
/// filter is tuned for.
pub fn unsharp_mask(rgb: &[u8], width: u32, height: u32, strength: f32) -> Vec<u8> {
    let blurred = gaussian_blur_rgb(rgb, width, height, 1.0);
    rgb.iter()
        .zip(blurred.iter())
        .map(|(&src, &blur)| {
            let v = src as f32 + strength * (src as f32 - blur);
            v.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

// ---------------------------------------------------------------------------
// sRGB <-> CIE Lab (D65), used by the glare rescue to equalize lightness
// without shifting chroma.
// ---------------------------------------------------------------------------

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    const DELTA: f32 = 6.0 / 29.0;
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    const DELTA: f32 = 6.0 / 29.0;
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

const XN: f32 = 0.950_47;
const YN: f32 = 1.0;
const ZN: f32 = 1.088_83;

/// Convert one RGB pixel to (L, a, b). L is in [0, 100].
pub fn rgb_to_lab(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let rl = srgb_to_linear(r as f32 / 255.0);
    let gl = srgb_to_linear(g as f32 / 255.0);
    let bl = srgb_to_linear(b as f32 / 255.0);

    let x = 0.4124 * rl + 0.3576 * gl + 0.1805 * bl;
    let y = 0.2126 * rl + 0.7152 * gl + 0.0722 * bl;
    let z = 0.0193 * rl + 0.1192 * gl + 0.9505 * bl;

    let fx = lab_f(x / XN);
    let fy = lab_f(y / YN);
    let fz = lab_f(z / ZN);

    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

/// Convert one (L, a, b) triple back to RGB.
pub fn lab_to_rgb(l: f32, a: f32, b: f32) -> (u8, u8, u8) {
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;

    let x = XN * lab_f_inv(fx);
    let y = YN * lab_f_inv(fy);
    let z = ZN * lab_f_inv(fz);

    let rl = 3.2406 * x - 1.5372 * y - 0.4986 * z;
    let gl = -0.9689 * x + 1.8758 * y + 0.0415 * z;
    let bl = 0.0557 * x - 0.2040 * y + 1.0570 * z;

    let to_byte = |c: f32| (linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0).round() as u8;
    (to_byte(rl), to_byte(gl), to_byte(bl))
}
