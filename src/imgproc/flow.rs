//! Dense optical flow between two grayscale frames.
//!
//! Coarse-to-fine polynomial expansion: each pixel neighborhood of both
//! frames is approximated by a quadratic polynomial under a Gaussian
//! applicability window, and the displacement field is solved from the
//! polynomial coefficients, refined over an image pyramid. The parameter
//! names follow the conventional polynomial-expansion formulation
//! (`pyr_scale`, `levels`, `winsize`, `iterations`, `poly_n`, `poly_sigma`).
//!
//! The shake and reposition detectors share one flow computation per frame;
//! this module is the only place the velocity field is produced.

use anyhow::{anyhow, Result};

/// Parameters for the coarse-to-fine flow estimator.
#[derive(Clone, Copy, Debug)]
pub struct FlowParams {
    /// Pyramid downscale factor per level.
    pub pyr_scale: f32,
    /// Number of pyramid levels (including full resolution).
    pub levels: u32,
    /// Averaging window for the displacement solve.
    pub winsize: usize,
    /// Refinement iterations per pyramid level.
    pub iterations: u32,
    /// Polynomial expansion neighborhood radius.
    pub poly_n: usize,
    /// Gaussian applicability sigma for the expansion.
    pub poly_sigma: f32,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            winsize: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

/// Per-pixel velocity field `(u, v)` in pixels per frame.
pub struct FlowField {
    pub width: u32,
    pub height: u32,
    pub u: Vec<f32>,
    pub v: Vec<f32>,
}

impl FlowField {
    /// Mean motion magnitude over the full frame.
    pub fn mean_magnitude(&self) -> f64 {
        if self.u.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .u
            .iter()
            .zip(self.v.iter())
            .map(|(&u, &v)| ((u * u + v * v) as f64).sqrt())
            .sum();
        sum / self.u.len() as f64
    }

    /// Mean `(u, v)` over the centered region of interest, excluding a
    /// border fraction on each side.
    pub fn mean_shift_centered(&self, border_frac: f32) -> (f64, f64) {
        let w = self.width as usize;
        let h = self.height as usize;
        let bx = ((w as f32 * border_frac) as usize).min(w / 2);
        let by = ((h as f32 * border_frac) as usize).min(h / 2);
        let (x0, x1) = (bx, w - bx);
        let (y0, y1) = (by, h - by);
        if x0 >= x1 || y0 >= y1 {
            return (0.0, 0.0);
        }
        let mut su = 0.0f64;
        let mut sv = 0.0f64;
        let mut n = 0usize;
        for y in y0..y1 {
            for x in x0..x1 {
                su += self.u[y * w + x] as f64;
                sv += self.v[y * w + x] as f64;
                n += 1;
            }
        }
        (su / n as f64, sv / n as f64)
    }
}

// ---------------------------------------------------------------------------
// Internal planes
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Plane {
    w: usize,
    h: usize,
    data: Vec<f32>,
}

impl Plane {
    fn zeros(w: usize, h: usize) -> Self {
        Self {
            w,
            h,
            data: vec![0.0; w * h],
        }
    }

    fn from_bytes(bytes: &[u8], w: usize, h: usize) -> Self {
        Self {
            w,
            h,
            data: bytes.iter().map(|&p| p as f32).collect(),
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.w + x]
    }

    fn sample_clamped(&self, x: f32, y: f32) -> f32 {
        let xc = x.clamp(0.0, (self.w - 1) as f32);
        let yc = y.clamp(0.0, (self.h - 1) as f32);
        let x0 = xc.floor() as usize;
        let y0 = yc.floor() as usize;
        let x1 = (x0 + 1).min(self.w - 1);
        let y1 = (y0 + 1).min(self.h - 1);
        let fx = xc - x0 as f32;
        let fy = yc - y0 as f32;
        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Bilinear resize, used for pyramid construction and flow upsampling.
    fn resized(&self, nw: usize, nh: usize) -> Plane {
        let mut out = Plane::zeros(nw, nh);
        let sx = self.w as f32 / nw as f32;
        let sy = self.h as f32 / nh as f32;
        for y in 0..nh {
            for x in 0..nw {
                out.data[y * nw + x] =
                    self.sample_clamped((x as f32 + 0.5) * sx - 0.5, (y as f32 + 0.5) * sy - 0.5);
            }
        }
        out
    }

    /// Separable box blur with the given window size (odd).
    fn box_blurred(&self, winsize: usize) -> Plane {
        let r = winsize / 2;
        let norm = 1.0 / winsize as f32;
        let mut tmp = Plane::zeros(self.w, self.h);
        for y in 0..self.h {
            for x in 0..self.w {
                let mut acc = 0.0;
                for k in 0..winsize {
                    let sx = (x as isize + k as isize - r as isize)
                        .clamp(0, self.w as isize - 1) as usize;
                    acc += self.at(sx, y);
                }
                tmp.data[y * self.w + x] = acc * norm;
            }
        }
        let mut out = Plane::zeros(self.w, self.h);
        for y in 0..self.h {
            for x in 0..self.w {
                let mut acc = 0.0;
                for k in 0..winsize {
                    let sy = (y as isize + k as isize - r as isize)
                        .clamp(0, self.h as isize - 1) as usize;
                    acc += tmp.at(x, sy);
                }
                out.data[y * self.w + x] = acc * norm;
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Polynomial expansion
// ---------------------------------------------------------------------------

/// Quadratic expansion coefficients per pixel:
/// `f(x) ~ c + b.x + x' A x` with `A = [[axx, axy/2], [axy/2, ayy]]`.
struct PolyExpansion {
    bx: Plane,
    by: Plane,
    axx: Plane,
    ayy: Plane,
    axy: Plane,
}

/// Precomputed applicability moments and the inverse metric for the
/// quadratic basis {1, x, y, x^2, y^2, xy}.
struct PolyBasis {
    g: Vec<f32>,
    xg: Vec<f32>,
    xxg: Vec<f32>,
    radius: usize,
    inv_s2: f32,
    inv_s2sq: f32,
    // Inverse rows of the coupled {1, x^2, y^2} block, for axx and ayy.
    inv_m3_row1: [f32; 3],
    inv_m3_row2: [f32; 3],
}

impl PolyBasis {
    fn new(radius: usize, sigma: f32) -> Self {
        let mut g = Vec::with_capacity(2 * radius + 1);
        for k in -(radius as i32)..=(radius as i32) {
            g.push((-(k * k) as f32 / (2.0 * sigma * sigma)).exp());
        }
        let total: f32 = g.iter().sum();
        for v in &mut g {
            *v /= total;
        }
        let xg: Vec<f32> = g
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as f32 - radius as f32) * v)
            .collect();
        let xxg: Vec<f32> = g
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let k = i as f32 - radius as f32;
                k * k * v
            })
            .collect();

        let s2: f32 = xxg.iter().sum();
        let s4: f32 = g
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let k = i as f32 - radius as f32;
                k * k * k * k * v
            })
            .sum();

        // Metric of the {1, x^2, y^2} block under the separable weight:
        //   [ 1    s2    s2  ]
        //   [ s2   s4   s2^2 ]
        //   [ s2  s2^2   s4  ]
        let m = [
            [1.0, s2, s2],
            [s2, s4, s2 * s2],
            [s2, s2 * s2, s4],
        ];
        let inv = invert3(&m);

        Self {
            g,
            xg,
            xxg,
            radius,
            inv_s2: 1.0 / s2,
            inv_s2sq: 1.0 / (s2 * s2),
            inv_m3_row1: inv[1],
            inv_m3_row2: inv[2],
        }
    }
}

fn invert3(m: &[[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    let inv_det = 1.0 / det;
    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let a = m[(i + 1) % 3][(j + 1) % 3] * m[(i + 2) % 3][(j + 2) % 3]
                - m[(i + 1) % 3][(j + 2) % 3] * m[(i + 2) % 3][(j + 1) % 3];
            // Transposed cofactor.
            out[j][i] = a * inv_det;
        }
    }
    out
}

fn poly_expand(img: &Plane, basis: &PolyBasis) -> PolyExpansion {
    let (w, h) = (img.w, img.h);
    let r = basis.radius;
    let taps = 2 * r + 1;

    // Horizontal pass: weighted moments along x.
    let mut s0 = Plane::zeros(w, h);
    let mut s1 = Plane::zeros(w, h);
    let mut s2 = Plane::zeros(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut m0 = 0.0;
            let mut m1 = 0.0;
            let mut m2 = 0.0;
            for k in 0..taps {
                let sx = (x as isize + k as isize - r as isize).clamp(0, w as isize - 1) as usize;
                let f = img.at(sx, y);
                m0 += basis.g[k] * f;
                m1 += basis.xg[k] * f;
                m2 += basis.xxg[k] * f;
            }
            s0.data[y * w + x] = m0;
            s1.data[y * w + x] = m1;
            s2.data[y * w + x] = m2;
        }
    }

    // Vertical pass: combine into the six 2-D moments, then solve for the
    // polynomial coefficients through the precomputed inverse metric.
    let mut out = PolyExpansion {
        bx: Plane::zeros(w, h),
        by: Plane::zeros(w, h),
        axx: Plane::zeros(w, h),
        ayy: Plane::zeros(w, h),
        axy: Plane::zeros(w, h),
    };
    for y in 0..h {
        for x in 0..w {
            let mut m00 = 0.0;
            let mut m10 = 0.0;
            let mut m01 = 0.0;
            let mut m20 = 0.0;
            let mut m02 = 0.0;
            let mut m11 = 0.0;
            for k in 0..taps {
                let sy = (y as isize + k as isize - r as isize).clamp(0, h as isize - 1) as usize;
                m00 += basis.g[k] * s0.at(x, sy);
                m10 += basis.g[k] * s1.at(x, sy);
                m01 += basis.xg[k] * s0.at(x, sy);
                m20 += basis.g[k] * s2.at(x, sy);
                m02 += basis.xxg[k] * s0.at(x, sy);
                m11 += basis.xg[k] * s1.at(x, sy);
            }
            let idx = y * w + x;
            out.bx.data[idx] = m10 * basis.inv_s2;
            out.by.data[idx] = m01 * basis.inv_s2;
            out.axy.data[idx] = m11 * basis.inv_s2sq;
            let r1 = basis.inv_m3_row1;
            let r2 = basis.inv_m3_row2;
            out.axx.data[idx] = r1[0] * m00 + r1[1] * m20 + r1[2] * m02;
            out.ayy.data[idx] = r2[0] * m00 + r2[1] * m20 + r2[2] * m02;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Displacement solve
// ---------------------------------------------------------------------------

/// One refinement pass at a single pyramid level.
fn refine_level(
    r1: &PolyExpansion,
    r2: &PolyExpansion,
    u: &mut Plane,
    v: &mut Plane,
    winsize: usize,
) {
    let (w, h) = (r1.bx.w, r1.bx.h);

    // Normal-equation planes: G = A'A (3 unique terms) and rhs = A'db.
    let mut g11 = Plane::zeros(w, h);
    let mut g12 = Plane::zeros(w, h);
    let mut g22 = Plane::zeros(w, h);
    let mut rb1 = Plane::zeros(w, h);
    let mut rb2 = Plane::zeros(w, h);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let du = u.data[idx];
            let dv = v.data[idx];
            let sx = x as f32 + du;
            let sy = y as f32 + dv;

            let a11 = 0.5 * (r1.axx.data[idx] + r2.axx.sample_clamped(sx, sy));
            let a22 = 0.5 * (r1.ayy.data[idx] + r2.ayy.sample_clamped(sx, sy));
            let a12 = 0.25 * (r1.axy.data[idx] + r2.axy.sample_clamped(sx, sy));

            let db1 = -0.5 * (r2.bx.sample_clamped(sx, sy) - r1.bx.data[idx]) + a11 * du + a12 * dv;
            let db2 = -0.5 * (r2.by.sample_clamped(sx, sy) - r1.by.data[idx]) + a12 * du + a22 * dv;

            g11.data[idx] = a11 * a11 + a12 * a12;
            g12.data[idx] = a12 * (a11 + a22);
            g22.data[idx] = a12 * a12 + a22 * a22;
            rb1.data[idx] = a11 * db1 + a12 * db2;
            rb2.data[idx] = a12 * db1 + a22 * db2;
        }
    }

    let g11 = g11.box_blurred(winsize);
    let g12 = g12.box_blurred(winsize);
    let g22 = g22.box_blurred(winsize);
    let rb1 = rb1.box_blurred(winsize);
    let rb2 = rb2.box_blurred(winsize);

    for idx in 0..w * h {
        let det = g11.data[idx] * g22.data[idx] - g12.data[idx] * g12.data[idx];
        if det.abs() < 1e-6 {
            continue; // flat neighborhood, keep the prior estimate
        }
        u.data[idx] = (g22.data[idx] * rb1.data[idx] - g12.data[idx] * rb2.data[idx]) / det;
        v.data[idx] = (g11.data[idx] * rb2.data[idx] - g12.data[idx] * rb1.data[idx]) / det;
    }
}

/// Compute the dense velocity field from `prev` to `cur`.
pub fn dense_flow(
    prev: &[u8],
    cur: &[u8],
    width: u32,
    height: u32,
    params: &FlowParams,
) -> Result<FlowField> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 {
        return Err(anyhow!("optical flow requires non-empty frames"));
    }
    if prev.len() != w * h || cur.len() != w * h {
        return Err(anyhow!(
            "optical flow plane size mismatch: {}x{} vs {} / {} bytes",
            w,
            h,
            prev.len(),
            cur.len()
        ));
    }

    let basis = PolyBasis::new(params.poly_n, params.poly_sigma);

    // Build pyramids, coarsest last. Levels that would underflow the
    // expansion window are dropped.
    let mut pyr_prev = vec![Plane::from_bytes(prev, w, h)];
    let mut pyr_cur = vec![Plane::from_bytes(cur, w, h)];
    let min_side = 2 * params.poly_n + 1;
    for _ in 1..params.levels.max(1) {
        let (lw, lh) = {
            let last = pyr_prev.last().unwrap();
            (last.w, last.h)
        };
        let nw = (lw as f32 * params.pyr_scale).round() as usize;
        let nh = (lh as f32 * params.pyr_scale).round() as usize;
        if nw < min_side || nh < min_side {
            break;
        }
        let next_prev = pyr_prev.last().unwrap().resized(nw, nh);
        let next_cur = pyr_cur.last().unwrap().resized(nw, nh);
        pyr_prev.push(next_prev);
        pyr_cur.push(next_cur);
    }

    let coarsest = pyr_prev.len() - 1;
    let mut u = Plane::zeros(pyr_prev[coarsest].w, pyr_prev[coarsest].h);
    let mut v = Plane::zeros(pyr_prev[coarsest].w, pyr_prev[coarsest].h);

    for level in (0..=coarsest).rev() {
        let p = &pyr_prev[level];
        let c = &pyr_cur[level];
        if u.w != p.w || u.h != p.h {
            // Upsample the coarser estimate and rescale displacements.
            let scale = p.w as f32 / u.w as f32;
            let mut nu = u.resized(p.w, p.h);
            let mut nv = v.resized(p.w, p.h);
            for val in nu.data.iter_mut() {
                *val *= scale;
            }
            for val in nv.data.iter_mut() {
                *val *= scale;
            }
            u = nu;
            v = nv;
        }

        let r1 = poly_expand(p, &basis);
        let r2 = poly_expand(c, &basis);
        for _ in 0..params.iterations.max(1) {
            refine_level(&r1, &r2, &mut u, &mut v, params.winsize);
        }
    }

    Ok(FlowField {
        width,
        height,
        u: u.data,
        v: v.data,
    })
}
