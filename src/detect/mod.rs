//! Per-frame interference detectors.
//!
//! Detectors are a closed variant rather than a trait-object hierarchy: the
//! pipeline owns one of each, evaluation order is fixed, and every detector
//! exposes the same `step`/`reset` surface. Detector state is mutated only
//! by the pipeline thread.
//!
//! The shake and reposition detectors both consume the dense velocity field;
//! the bank computes that field once per frame and hands both detectors the
//! same reference.

mod blur;
mod glare;
mod liveness;
mod motion;

pub use blur::BlurDetector;
pub use glare::{GlareDetector, GlareStats};
pub use liveness::LivenessDetector;
pub use motion::{cardinal_direction, RepositionDetector, ShakeDetector};

use serde::Serialize;

use crate::config::{SensorToggles, Thresholds};
use crate::frame::Frame;
use crate::imgproc::flow::{dense_flow, FlowField, FlowParams};

/// Identifies which check produced a signal. Maps one-to-one onto the
/// incident kinds the aggregator manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Blur,
    Shake,
    Glare,
    Reposition,
    Frozen,
    Blackout,
    MajorTamper,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Blur => "blur",
            SignalKind::Shake => "shake",
            SignalKind::Glare => "glare",
            SignalKind::Reposition => "reposition",
            SignalKind::Frozen => "frozen",
            SignalKind::Blackout => "blackout",
            SignalKind::MajorTamper => "major_tamper",
        }
    }

    pub const ALL: [SignalKind; 7] = [
        SignalKind::Blur,
        SignalKind::Shake,
        SignalKind::Glare,
        SignalKind::Reposition,
        SignalKind::Frozen,
        SignalKind::Blackout,
        SignalKind::MajorTamper,
    ];
}

/// Shape-specific measurement payload carried next to the raw metric.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum SignalAux {
    None,
    Blur {
        variance: f64,
    },
    Glare {
        dark_pct: f64,
        mid_pct: f64,
        bright_pct: f64,
        histogram: Vec<u32>,
    },
    Liveness {
        diff: f64,
        brightness: f64,
    },
    Shake {
        magnitude: f64,
    },
    Reposition {
        shift_x: f64,
        shift_y: f64,
        magnitude: f64,
        direction: Option<&'static str>,
        fast_path: bool,
    },
}

/// One detector's verdict for one frame. Transient; never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionSignal {
    pub kind: SignalKind,
    pub raw_metric: f64,
    pub tripped: bool,
    pub aux: SignalAux,
}

impl DetectionSignal {
    pub fn quiet(kind: SignalKind) -> Self {
        Self {
            kind,
            raw_metric: 0.0,
            tripped: false,
            aux: SignalAux::None,
        }
    }
}

/// The full detector bank with shared per-frame flow computation.
pub struct DetectorBank {
    pub blur: BlurDetector,
    pub glare: GlareDetector,
    pub liveness: LivenessDetector,
    pub shake: ShakeDetector,
    pub reposition: RepositionDetector,
    flow_params: FlowParams,
}

impl DetectorBank {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self {
            blur: BlurDetector::new(thresholds.blur),
            glare: GlareDetector::new(),
            liveness: LivenessDetector::new(thresholds),
            shake: ShakeDetector::new(thresholds.shake),
            reposition: RepositionDetector::new(thresholds),
            flow_params: FlowParams::default(),
        }
    }

    /// Run all enabled detectors against the current frame.
    ///
    /// `prev_gray` is the immediately prior grayscale frame; motion-dependent
    /// detectors are skipped (quiet signal) when it is absent. Flow or
    /// histogram failures on malformed frames degrade to quiet signals, never
    /// abort the frame.
    pub fn run(
        &mut self,
        frame: &Frame,
        prev_gray: Option<&[u8]>,
        toggles: &SensorToggles,
    ) -> Vec<DetectionSignal> {
        let mut signals = Vec::with_capacity(7);

        let blur_signal = if toggles.blur {
            self.blur.step(frame)
        } else {
            DetectionSignal::quiet(SignalKind::Blur)
        };

        let glare_signal = if toggles.glare {
            self.glare.step(frame)
        } else {
            DetectionSignal::quiet(SignalKind::Glare)
        };

        // One flow computation shared by shake and reposition. Motion always
        // runs on raw grayscale; rescue only affects the emitted frame.
        let want_flow = (toggles.shake || toggles.reposition) && prev_gray.is_some();
        let flow: Option<FlowField> = if want_flow {
            match dense_flow(
                prev_gray.unwrap_or(&[]),
                frame.gray(),
                frame.width,
                frame.height,
                &self.flow_params,
            ) {
                Ok(field) => Some(field),
                Err(err) => {
                    log::warn!("optical flow failed, skipping motion detectors: {err}");
                    None
                }
            }
        } else {
            None
        };

        let shake_signal = match (&flow, toggles.shake) {
            (Some(field), true) => self.shake.step(field),
            _ => DetectionSignal::quiet(SignalKind::Shake),
        };
        let reposition_signal = match (&flow, toggles.reposition) {
            (Some(field), true) => self.reposition.step(frame.timestamp_s, field),
            _ => DetectionSignal::quiet(SignalKind::Reposition),
        };

        let liveness_signals = if toggles.liveness {
            self.liveness.step(frame)
        } else {
            [
                DetectionSignal::quiet(SignalKind::Frozen),
                DetectionSignal::quiet(SignalKind::Blackout),
                DetectionSignal::quiet(SignalKind::MajorTamper),
            ]
        };

        // A large frame difference with a coherent reposition or a defocused
        // lens is not a scene replacement; major tamper stands only when both
        // of those are negative this frame.
        let blur_tripped = blur_signal.tripped;
        let reposition_tripped = reposition_signal.tripped;

        signals.push(blur_signal);
        signals.push(glare_signal);
        signals.push(shake_signal);
        signals.push(reposition_signal);
        for mut signal in liveness_signals {
            if signal.kind == SignalKind::MajorTamper && (blur_tripped || reposition_tripped) {
                signal.tripped = false;
            }
            signals.push(signal);
        }

        signals
    }

    pub fn reset(&mut self) {
        self.blur.reset();
        self.glare.reset();
        self.liveness.reset();
        self.shake.reset();
        self.reposition.reset();
    }
}
