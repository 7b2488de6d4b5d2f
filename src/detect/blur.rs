//! Lens obscuration detection via Laplacian variance.

use crate::detect::{DetectionSignal, SignalAux, SignalKind};
use crate::frame::Frame;
use crate::imgproc;

/// Sharpening gain applied by the optional blur correction.
pub const SHARPEN_STRENGTH: f32 = 1.5;

/// Trips when the variance of the Laplacian response falls below the
/// configured threshold. Carries no temporal state of its own; the
/// aggregator enforces the sustain window.
pub struct BlurDetector {
    threshold: f64,
}

impl BlurDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn step(&mut self, frame: &Frame) -> DetectionSignal {
        let variance = imgproc::laplacian_variance(frame.gray(), frame.width, frame.height);
        DetectionSignal {
            kind: SignalKind::Blur,
            raw_metric: variance,
            tripped: variance < self.threshold,
            aux: SignalAux::Blur { variance },
        }
    }

    pub fn reset(&mut self) {}

    /// Unsharp-mask correction for the outgoing frame, applied before
    /// watermark embedding when the blur fix is enabled and the detector is
    /// tripped.
    pub fn corrected(frame: &Frame) -> Vec<u8> {
        imgproc::unsharp_mask(frame.rgb(), frame.width, frame.height, SHARPEN_STRENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from_gray(gray: &[u8], w: u32, h: u32) -> Frame {
        let rgb: Vec<u8> = gray.iter().flat_map(|&p| [p, p, p]).collect();
        Frame::new(0.0, w, h, rgb).unwrap()
    }

    #[test]
    fn flat_frame_is_blurry() {
        let mut det = BlurDetector::new(70.0);
        let frame = frame_from_gray(&[90u8; 64], 8, 8);
        let signal = det.step(&frame);
        assert!(signal.tripped);
        assert!(signal.raw_metric < 1.0);
    }

    #[test]
    fn sharp_frame_is_not_blurry() {
        let mut det = BlurDetector::new(70.0);
        let mut gray = vec![0u8; 64];
        for (i, p) in gray.iter_mut().enumerate() {
            if (i / 8 + i % 8) % 2 == 0 {
                *p = 255;
            }
        }
        let frame = frame_from_gray(&gray, 8, 8);
        assert!(!det.step(&frame).tripped);
    }

    #[test]
    fn variance_at_threshold_is_not_blurry() {
        // Strict less-than: a flat frame has variance 0, which is not below
        // a threshold of 0.
        let mut det = BlurDetector::new(0.0);
        let frame = frame_from_gray(&[128u8; 64], 8, 8);
        assert!(!det.step(&frame).tripped);
    }

    #[test]
    fn correction_keeps_dimensions() {
        let frame = frame_from_gray(&[100u8; 64], 8, 8);
        let out = BlurDetector::corrected(&frame);
        assert_eq!(out.len(), frame.rgb().len());
    }
}
