//! Mechanical shake and deliberate reposition detection.
//!
//! Both detectors read the same dense velocity field. Shake looks at the
//! mean motion magnitude over the whole frame; a physical impact moves every
//! pixel at once. Reposition watches the central region's mean shift vector
//! over a short history: a jerked mount trips the fast path immediately,
//! while a slow deliberate pan never clears the fast threshold but
//! accumulates directionally consistent evidence. Shake oscillates, so its
//! direction votes cancel and the slow path stays quiet for it.

use std::collections::VecDeque;

use crate::config::Thresholds;
use crate::detect::{DetectionSignal, SignalAux, SignalKind};
use crate::imgproc::flow::FlowField;

/// Entries retained in the reposition history.
const HISTORY_DEPTH: usize = 10;
/// Most recent entries examined by the slow path.
const SLOW_WINDOW: usize = 5;
/// High-magnitude frames required inside the slow window.
const SLOW_VOTES: usize = 4;
/// Entries below this magnitude do not vote on direction.
const DIRECTION_FLOOR: f64 = 5.0;
/// Border fraction excluded from the reposition region of interest.
const ROI_BORDER_FRAC: f32 = 0.10;
/// History is discarded after this long without a high-magnitude frame.
const IDLE_RESET_S: f64 = 10.0;

pub struct ShakeDetector {
    threshold: f64,
}

impl ShakeDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn step(&mut self, flow: &FlowField) -> DetectionSignal {
        let magnitude = flow.mean_magnitude();
        DetectionSignal {
            kind: SignalKind::Shake,
            raw_metric: magnitude,
            tripped: magnitude > self.threshold,
            aux: SignalAux::Shake { magnitude },
        }
    }

    pub fn reset(&mut self) {}
}

pub struct RepositionDetector {
    threshold: f64,
    fast_threshold: f64,
    consistency_threshold: f64,
    /// `(shift_magnitude, unit_direction)` for the last N processed frames.
    history: VecDeque<(f64, (f64, f64))>,
    /// Last time a high-magnitude shift was seen (or the history was reset).
    last_activity_ts: Option<f64>,
}

impl RepositionDetector {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self {
            threshold: thresholds.reposition,
            fast_threshold: thresholds.fast_reposition,
            consistency_threshold: thresholds.direction_consistency,
            history: VecDeque::with_capacity(HISTORY_DEPTH),
            last_activity_ts: None,
        }
    }

    pub fn step(&mut self, now_s: f64, flow: &FlowField) -> DetectionSignal {
        // Stale history carries no evidence about the current orientation.
        if let Some(last) = self.last_activity_ts {
            if now_s - last > IDLE_RESET_S {
                self.history.clear();
                self.last_activity_ts = Some(now_s);
            }
        } else {
            self.last_activity_ts = Some(now_s);
        }

        let (shift_x, shift_y) = flow.mean_shift_centered(ROI_BORDER_FRAC);
        let magnitude = (shift_x * shift_x + shift_y * shift_y).sqrt();
        let unit = if magnitude > f64::EPSILON {
            (shift_x / magnitude, shift_y / magnitude)
        } else {
            (0.0, 0.0)
        };

        if magnitude > self.threshold {
            self.last_activity_ts = Some(now_s);
        }

        if self.history.len() == HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back((magnitude, unit));

        let fast_path = magnitude > self.fast_threshold;
        let tripped = fast_path || self.slow_path_trips();

        let direction = if magnitude > f64::EPSILON {
            Some(cardinal_direction(shift_x, shift_y))
        } else {
            None
        };

        DetectionSignal {
            kind: SignalKind::Reposition,
            raw_metric: magnitude,
            tripped,
            aux: SignalAux::Reposition {
                shift_x,
                shift_y,
                magnitude,
                direction,
                fast_path,
            },
        }
    }

    /// Sustained-pan rule over the most recent window: at least four of five
    /// frames above the reposition threshold, with a directionally consistent
    /// mean among the entries large enough to vote.
    fn slow_path_trips(&self) -> bool {
        if self.history.len() < SLOW_WINDOW {
            return false;
        }
        let window: Vec<_> = self
            .history
            .iter()
            .rev()
            .take(SLOW_WINDOW)
            .copied()
            .collect();

        let votes = window
            .iter()
            .filter(|(mag, _)| *mag > self.threshold)
            .count();
        if votes < SLOW_VOTES {
            return false;
        }

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut voters = 0usize;
        for (mag, (dx, dy)) in &window {
            if *mag > DIRECTION_FLOOR {
                sum_x += dx;
                sum_y += dy;
                voters += 1;
            }
        }
        if voters == 0 {
            return false;
        }
        let mean_x = sum_x / voters as f64;
        let mean_y = sum_y / voters as f64;
        let consistency = (mean_x * mean_x + mean_y * mean_y).sqrt();
        consistency > self.consistency_threshold
    }

    /// Clear all accumulated evidence. Called on operator acknowledgement.
    pub fn reset(&mut self) {
        self.history.clear();
        self.last_activity_ts = None;
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Human-readable direction of the mean shift vector. Image coordinates:
/// positive y is downward.
pub fn cardinal_direction(shift_x: f64, shift_y: f64) -> &'static str {
    let ax = shift_x.abs();
    let ay = shift_y.abs();
    if ax >= 2.0 * ay {
        if shift_x >= 0.0 {
            "right"
        } else {
            "left"
        }
    } else if ay >= 2.0 * ax {
        if shift_y >= 0.0 {
            "down"
        } else {
            "up"
        }
    } else {
        match (shift_x >= 0.0, shift_y >= 0.0) {
            (true, true) => "down-right",
            (true, false) => "up-right",
            (false, true) => "down-left",
            (false, false) => "up-left",
        }
    }
}
