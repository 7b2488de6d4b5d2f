//! Feed stasis, blackout, and scene-replacement detection.
//!
//! Holds a reference grayscale frame captured at pipeline start and
//! refreshed on a fixed interval. Each incoming frame is compared against
//! the reference by mean absolute difference; mean brightness covers the
//! blackout case. All three signals are suppressed during the activation
//! window after startup so exposure transients cannot raise incidents.

use crate::config::Thresholds;
use crate::detect::{DetectionSignal, SignalAux, SignalKind};
use crate::frame::Frame;
use crate::imgproc;

pub struct LivenessDetector {
    frozen_threshold: f64,
    blackout_threshold: f64,
    major_tamper_threshold: f64,
    check_interval_s: f64,
    activation_s: f64,
    reference: Option<Vec<u8>>,
    reference_ts: f64,
    startup_ts: Option<f64>,
}

impl LivenessDetector {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self {
            frozen_threshold: thresholds.liveness,
            blackout_threshold: thresholds.blackout_brightness,
            major_tamper_threshold: thresholds.major_tamper,
            check_interval_s: thresholds.liveness_check_interval_s,
            activation_s: thresholds.liveness_activation_s,
            reference: None,
            reference_ts: 0.0,
            startup_ts: None,
        }
    }

    /// Compare the frame against the reference and emit the three liveness
    /// signals (frozen, blackout, major tamper), in that order.
    pub fn step(&mut self, frame: &Frame) -> [DetectionSignal; 3] {
        let now = frame.timestamp_s;

        let Some(reference) = self.reference.as_deref() else {
            // First frame: capture the reference, start the activation clock,
            // emit quiet signals.
            self.reference = Some(frame.gray().to_vec());
            self.reference_ts = now;
            self.startup_ts = Some(now);
            return [
                DetectionSignal::quiet(SignalKind::Frozen),
                DetectionSignal::quiet(SignalKind::Blackout),
                DetectionSignal::quiet(SignalKind::MajorTamper),
            ];
        };

        let gray = frame.gray();
        let diff = if gray.len() == reference.len() {
            imgproc::mean_abs_diff(gray, reference)
        } else {
            // Resolution changed under us; rebase the reference and skip.
            self.reference = Some(gray.to_vec());
            self.reference_ts = now;
            return [
                DetectionSignal::quiet(SignalKind::Frozen),
                DetectionSignal::quiet(SignalKind::Blackout),
                DetectionSignal::quiet(SignalKind::MajorTamper),
            ];
        };
        let brightness = imgproc::mean(gray);

        let active = self
            .startup_ts
            .map(|start| now - start >= self.activation_s)
            .unwrap_or(false);

        let aux = SignalAux::Liveness { diff, brightness };
        let frozen = DetectionSignal {
            kind: SignalKind::Frozen,
            raw_metric: diff,
            tripped: active && diff < self.frozen_threshold,
            aux: aux.clone(),
        };
        let blackout = DetectionSignal {
            kind: SignalKind::Blackout,
            raw_metric: brightness,
            tripped: active && brightness < self.blackout_threshold,
            aux: aux.clone(),
        };
        let major = DetectionSignal {
            kind: SignalKind::MajorTamper,
            raw_metric: diff,
            tripped: active && diff > self.major_tamper_threshold,
            aux,
        };

        // Refresh the reference after the checks so a slow drift cannot hide
        // inside a single interval.
        if now - self.reference_ts >= self.check_interval_s {
            self.reference = Some(gray.to_vec());
            self.reference_ts = now;
        }

        [frozen, blackout, major]
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.reference_ts = 0.0;
        self.startup_ts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;

    fn frame(ts: f64, level: u8) -> Frame {
        Frame::new(ts, 16, 16, vec![level; 16 * 16 * 3]).unwrap()
    }

    fn detector() -> LivenessDetector {
        LivenessDetector::new(&Thresholds::default())
    }

    #[test]
    fn first_frame_is_quiet() {
        let mut det = detector();
        let signals = det.step(&frame(100.0, 128));
        assert!(signals.iter().all(|s| !s.tripped));
    }

    #[test]
    fn activation_window_suppresses_frozen() {
        let mut det = detector();
        det.step(&frame(100.0, 128));
        // Identical frame at +5 s: diff 0, but inside the 10 s window.
        let signals = det.step(&frame(105.0, 128));
        assert!(!signals[0].tripped, "frozen must stay quiet during warm-up");
        // Identical frame at +11 s: window passed, frozen trips.
        let signals = det.step(&frame(111.0, 128));
        assert!(signals[0].tripped);
        assert!(signals[0].raw_metric < 2.0);
    }

    #[test]
    fn blackout_trips_on_dark_frames() {
        let mut det = detector();
        det.step(&frame(100.0, 128));
        let signals = det.step(&frame(111.0, 5));
        assert!(signals[1].tripped, "brightness 5 is below the 25 threshold");
    }

    #[test]
    fn major_tamper_trips_on_scene_replacement() {
        let mut det = detector();
        det.step(&frame(100.0, 10));
        // Reference refreshes every 3 s; jump past activation with the same
        // scene, then replace it entirely.
        let signals = det.step(&frame(110.5, 10));
        assert!(!signals[2].tripped);
        let signals = det.step(&frame(111.0, 200));
        assert!(signals[2].tripped, "diff 190 exceeds the 60 threshold");
    }

    #[test]
    fn reference_refresh_tracks_slow_change() {
        let mut det = detector();
        det.step(&frame(100.0, 100));
        // After the check interval the reference rebases, so a later frame
        // at the same level reads as frozen rather than changed.
        det.step(&frame(104.0, 140));
        let signals = det.step(&frame(112.0, 140));
        assert!(signals[0].tripped, "rebased reference makes diff ~0");
    }
}
