//! High-intensity washout detection and CLAHE rescue.
//!
//! Glare is recognized by its tri-band histogram signature: a washed-out
//! scene loses mid-tones to both ends of the intensity range at once, so the
//! check requires a large dark share, a non-trivial bright share, and a
//! collapsed middle simultaneously.

use crate::detect::{DetectionSignal, SignalAux, SignalKind};
use crate::frame::{Frame, CHANNELS};
use crate::imgproc::{self, clahe};

/// Upper bound of the dark band (inclusive).
const DARK_MAX: usize = 50;
/// Lower bound of the bright band (inclusive).
const BRIGHT_MIN: usize = 252;

const DARK_PCT_TRIP: f64 = 30.0;
const BRIGHT_PCT_TRIP: f64 = 1.0;
const MID_PCT_TRIP: f64 = 60.0;

/// CLAHE clip limit and tile grid used by the rescue path.
const CLAHE_CLIP_LIMIT: f32 = 16.0;
const CLAHE_GRID: u32 = 4;
/// Unsharp gain applied after equalization.
const RESCUE_SHARPEN: f32 = 1.0;
/// Blown-out source pixels are flattened to this neutral gray.
const BLOWOUT_GRAY: u8 = 150;

/// Band percentages plus the full histogram, reported per frame.
#[derive(Clone, Debug)]
pub struct GlareStats {
    pub dark_pct: f64,
    pub mid_pct: f64,
    pub bright_pct: f64,
    pub histogram: [u32; 256],
}

pub struct GlareDetector;

impl GlareDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn step(&mut self, frame: &Frame) -> DetectionSignal {
        let stats = Self::stats(frame.gray());
        let tripped = stats.dark_pct > DARK_PCT_TRIP
            && stats.bright_pct > BRIGHT_PCT_TRIP
            && stats.mid_pct < MID_PCT_TRIP;
        DetectionSignal {
            kind: SignalKind::Glare,
            raw_metric: stats.bright_pct,
            tripped,
            aux: SignalAux::Glare {
                dark_pct: stats.dark_pct,
                mid_pct: stats.mid_pct,
                bright_pct: stats.bright_pct,
                histogram: stats.histogram.to_vec(),
            },
        }
    }

    pub fn reset(&mut self) {}

    pub fn stats(gray: &[u8]) -> GlareStats {
        let histogram = imgproc::histogram256(gray);
        let total = gray.len().max(1) as f64;
        let dark: u32 = histogram[..=DARK_MAX].iter().sum();
        let bright: u32 = histogram[BRIGHT_MIN..].iter().sum();
        let mid: u32 = histogram[DARK_MAX + 1..BRIGHT_MIN].iter().sum();
        GlareStats {
            dark_pct: dark as f64 / total * 100.0,
            mid_pct: mid as f64 / total * 100.0,
            bright_pct: bright as f64 / total * 100.0,
            histogram,
        }
    }

    /// Rescue a glare-degraded frame.
    ///
    /// Lightness is equalized in Lab space so chroma survives, the result is
    /// re-sharpened, and source pixels that were already blown out are
    /// flattened to neutral gray rather than left as false detail.
    pub fn rescued(frame: &Frame) -> Vec<u8> {
        let rgb = frame.rgb();
        let (w, h) = (frame.width, frame.height);
        let pixels = frame.pixel_count();

        // Split into Lab planes; lightness is scaled onto [0, 255] for the
        // histogram equalizer.
        let mut l_plane = vec![0u8; pixels];
        let mut a_plane = vec![0.0f32; pixels];
        let mut b_plane = vec![0.0f32; pixels];
        for (i, px) in rgb.chunks_exact(CHANNELS).enumerate() {
            let (l, a, b) = imgproc::rgb_to_lab(px[0], px[1], px[2]);
            l_plane[i] = (l * 2.55).round().clamp(0.0, 255.0) as u8;
            a_plane[i] = a;
            b_plane[i] = b;
        }

        let l_eq = clahe::equalize(&l_plane, w, h, CLAHE_CLIP_LIMIT, CLAHE_GRID);

        let mut merged = Vec::with_capacity(rgb.len());
        for i in 0..pixels {
            let (r, g, b) = imgproc::lab_to_rgb(l_eq[i] as f32 / 2.55, a_plane[i], b_plane[i]);
            merged.extend_from_slice(&[r, g, b]);
        }

        let mut out = imgproc::unsharp_mask(&merged, w, h, RESCUE_SHARPEN);

        for (i, px) in rgb.chunks_exact(CHANNELS).enumerate() {
            if px.iter().any(|&c| c as usize > BRIGHT_MIN) {
                out[i * CHANNELS] = BLOWOUT_GRAY;
                out[i * CHANNELS + 1] = BLOWOUT_GRAY;
                out[i * CHANNELS + 2] = BLOWOUT_GRAY;
            }
        }
        out
    }
}

impl Default for GlareDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a frame with the requested share of dark / mid / bright pixels.
    fn banded_frame(dark_pct: usize, bright_pct: usize) -> Frame {
        let total = 100 * 100;
        let dark = total * dark_pct / 100;
        let bright = total * bright_pct / 100;
        let mut gray = Vec::with_capacity(total);
        gray.extend(std::iter::repeat(10u8).take(dark));
        gray.extend(std::iter::repeat(255u8).take(bright));
        gray.extend(std::iter::repeat(128u8).take(total - dark - bright));
        let rgb: Vec<u8> = gray.iter().flat_map(|&p| [p, p, p]).collect();
        Frame::new(0.0, 100, 100, rgb).unwrap()
    }

    #[test]
    fn washout_signature_trips() {
        // dark 45%, bright 5%, mid 50% -> all three conditions hold.
        let mut det = GlareDetector::new();
        let signal = det.step(&banded_frame(45, 5));
        assert!(signal.tripped);
        match signal.aux {
            SignalAux::Glare {
                dark_pct,
                mid_pct,
                bright_pct,
                ref histogram,
            } => {
                assert!((dark_pct - 45.0).abs() < 1.0);
                assert!((bright_pct - 5.0).abs() < 1.0);
                assert!(mid_pct < 60.0);
                assert_eq!(histogram.len(), 256);
            }
            _ => panic!("glare aux expected"),
        }
    }

    #[test]
    fn balanced_frame_does_not_trip() {
        let mut det = GlareDetector::new();
        assert!(!det.step(&banded_frame(10, 5)).tripped);
    }

    #[test]
    fn bright_only_frame_does_not_trip() {
        // Plenty of bright pixels but a healthy mid band.
        let mut det = GlareDetector::new();
        assert!(!det.step(&banded_frame(0, 20)).tripped);
    }

    #[test]
    fn rescue_preserves_shape_and_flattens_blowout() {
        let frame = banded_frame(45, 5);
        let out = GlareDetector::rescued(&frame);
        assert_eq!(out.len(), frame.rgb().len());

        for (src, dst) in frame.rgb().chunks_exact(3).zip(out.chunks_exact(3)) {
            if src.iter().any(|&c| c > 252) {
                assert_eq!(dst, &[BLOWOUT_GRAY; 3]);
            }
        }
    }

    #[test]
    fn band_edges_are_inclusive() {
        let gray = [50u8, 51, 251, 252];
        let stats = GlareDetector::stats(&gray);
        assert!((stats.dark_pct - 25.0).abs() < 1e-9);
        assert!((stats.mid_pct - 50.0).abs() < 1e-9);
        assert!((stats.bright_pct - 25.0).abs() < 1e-9);
    }
}
