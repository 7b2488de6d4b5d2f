//! Contrast-limited adaptive histogram equalization.
//!
//! Operates on a single 8-bit plane (the rescue path feeds it the Lab
//! lightness channel). The plane is divided into a tile grid; each tile gets
//! its own clipped-histogram equalization LUT, and pixels are mapped by
//! bilinear interpolation between the four nearest tile LUTs so tile seams
//! do not show.

/// Apply CLAHE to an 8-bit plane.
///
/// `clip_limit` follows the usual convention: the per-bin cap is
/// `clip_limit * tile_area / 256`, never below 1. Clipped excess is
/// redistributed uniformly across all bins.
pub fn equalize(gray: &[u8], width: u32, height: u32, clip_limit: f32, grid: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let grid = grid.max(1) as usize;
    if w == 0 || h == 0 {
        return Vec::new();
    }

    // Tile boundaries; the last row/column absorbs the remainder.
    let tile_x = |i: usize| i * w / grid;
    let tile_y = |i: usize| i * h / grid;

    // Per-tile equalization LUTs.
    let mut luts = vec![[0u8; 256]; grid * grid];
    let mut centers_x = vec![0.0f32; grid];
    let mut centers_y = vec![0.0f32; grid];

    for ty in 0..grid {
        let (y0, y1) = (tile_y(ty), tile_y(ty + 1).max(tile_y(ty) + 1));
        centers_y[ty] = (y0 + y1) as f32 / 2.0;
        for tx in 0..grid {
            let (x0, x1) = (tile_x(tx), tile_x(tx + 1).max(tile_x(tx) + 1));
            centers_x[tx] = (x0 + x1) as f32 / 2.0;

            let area = (x1 - x0) * (y1 - y0);
            let mut hist = [0u32; 256];
            for y in y0..y1.min(h) {
                for x in x0..x1.min(w) {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            // Clip and redistribute.
            let cap = ((clip_limit * area as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > cap {
                    excess += *bin - cap;
                    *bin = cap;
                }
            }
            let bonus = excess / 256;
            let leftover = (excess % 256) as usize;
            for bin in hist.iter_mut() {
                *bin += bonus;
            }
            for bin in hist.iter_mut().take(leftover) {
                *bin += 1;
            }

            // Cumulative mapping to [0, 255].
            let lut = &mut luts[ty * grid + tx];
            let mut cdf = 0u64;
            for v in 0..256 {
                cdf += hist[v] as u64;
                lut[v] = ((cdf * 255) / area as u64).min(255) as u8;
            }
        }
    }

    // Bilinear interpolation between surrounding tile LUTs.
    let mut out = vec![0u8; w * h];
    for y in 0..h {
        let (ty0, ty1, fy) = interp_index(y as f32, &centers_y);
        for x in 0..w {
            let (tx0, tx1, fx) = interp_index(x as f32, &centers_x);
            let v = gray[y * w + x] as usize;

            let v00 = luts[ty0 * grid + tx0][v] as f32;
            let v01 = luts[ty0 * grid + tx1][v] as f32;
            let v10 = luts[ty1 * grid + tx0][v] as f32;
            let v11 = luts[ty1 * grid + tx1][v] as f32;

            let top = v00 * (1.0 - fx) + v01 * fx;
            let bottom = v10 * (1.0 - fx) + v11 * fx;
            out[y * w + x] = (top * (1.0 - fy) + bottom * fy).round() as u8;
        }
    }
    out
}

/// Locate the two tile centers bracketing `pos` and the interpolation
/// fraction between them. Positions outside the outer centers clamp to the
/// edge tile.
fn interp_index(pos: f32, centers: &[f32]) -> (usize, usize, f32) {
    if pos <= centers[0] {
        return (0, 0, 0.0);
    }
    let last = centers.len() - 1;
    if pos >= centers[last] {
        return (last, last, 0.0);
    }
    let mut hi = 1;
    while centers[hi] < pos {
        hi += 1;
    }
    let lo = hi - 1;
    let span = centers[hi] - centers[lo];
    let f = if span > 0.0 { (pos - centers[lo]) / span } else { 0.0 };
    (lo, hi, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_matches_input_dimensions() {
        let gray = vec![128u8; 64 * 48];
        let out = equalize(&gray, 64, 48, 16.0, 4);
        assert_eq!(out.len(), gray.len());
    }

    #[test]
    fn flat_plane_stays_near_its_level() {
        // Clipping caps the single-bin spike, so a uniform plane maps close
        // to identity instead of blowing out to white.
        let gray = vec![128u8; 64 * 64];
        let out = equalize(&gray, 64, 64, 4.0, 4);
        let mean: f64 = out.iter().map(|&p| p as f64).sum::<f64>() / out.len() as f64;
        assert!((mean - 128.0).abs() < 32.0, "mean drifted to {mean}");
    }

    #[test]
    fn stretches_low_contrast_plane() {
        // Narrow band of intensities widens after equalization.
        let mut gray = vec![0u8; 64 * 64];
        for (i, p) in gray.iter_mut().enumerate() {
            *p = 120 + (i % 16) as u8;
        }
        let out = equalize(&gray, 64, 64, 16.0, 4);
        let (min_in, max_in) = (120u8, 135u8);
        let min_out = *out.iter().min().unwrap();
        let max_out = *out.iter().max().unwrap();
        assert!(
            max_out - min_out > max_in - min_in,
            "contrast did not expand: [{min_out}, {max_out}]"
        );
    }

    #[test]
    fn values_cover_valid_range_only() {
        let gray: Vec<u8> = (0..64 * 64).map(|i| (i % 256) as u8).collect();
        let out = equalize(&gray, 64, 64, 16.0, 4);
        assert!(out.iter().all(|&p| p <= 255));
        assert!(out.iter().any(|&p| p > 200), "equalized plane should reach the bright end");
    }
}
