//! Sentinel Kernel
//!
//! Tamper-resistant video surveillance core. Live frames flow through a
//! single-writer pipeline that detects six classes of interference, folds
//! per-frame signals into persistent incidents, and stamps every outgoing
//! frame with a time-keyed cryptographic watermark so offline analysis can
//! prove the footage was produced live.
//!
//! # Architecture
//!
//! 1. **Capture** ([`capture`]) yields timestamped RGB frames.
//! 2. **Detector bank** ([`detect`]) runs blur, glare, liveness/blackout,
//!    shake, and reposition checks with one shared optical-flow computation.
//! 3. **Aggregator** ([`aggregate`]) debounces signals into incidents with
//!    sustain, grouping, and cooling windows.
//! 4. **Enhancement** (blur unsharp fix, CLAHE glare rescue) rewrites the
//!    outgoing frame when enabled; detection always sees raw pixels.
//! 5. **Watermark** ([`watermark`]) embeds the per-second HMAC color token;
//!    the offline validator in the same module decides live vs. replayed.
//! 6. **Sink/persistence** ([`sink`], [`storage`]) hand events to the
//!    transport layer and the relational store without ever stalling the
//!    frame loop.
//!
//! Transport, UI, audio transcription, and the camera driver are external
//! collaborators; the kernel consumes a [`capture::CaptureSource`] and emits
//! structured events plus watermarked frames. It never opens sockets.

use serde::Serialize;

pub mod aggregate;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod imgproc;
pub mod pipeline;
pub mod sink;
pub mod storage;
pub mod watermark;

pub use aggregate::{Aggregator, Incident, IncidentTransition};
pub use capture::{open_source, CaptureSource, FileSource, SyntheticSource};
pub use config::{GlareRescueMode, KernelConfig, SensorToggles, Thresholds};
pub use detect::{DetectionSignal, DetectorBank, SignalAux, SignalKind};
pub use frame::{BufferPool, Frame};
pub use pipeline::{ExitStatus, Pipeline, PipelineHandle, PublishedFrame};
pub use sink::{DetectionRecord, EventQueue, SinkEvent};
pub use storage::IncidentStore;
pub use watermark::{
    validate_frames, validate_recording, ValidationReport, ValidationStatus, ValidationTolerances,
    ValidatorClock, WatermarkEmbedder, WatermarkKey,
};

/// Incident classes tracked by the aggregator and the persistence layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    Blur,
    Shake,
    Glare,
    Reposition,
    Frozen,
    Blackout,
    MajorTamper,
    CaptureLost,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::Blur => "blur",
            IncidentKind::Shake => "shake",
            IncidentKind::Glare => "glare",
            IncidentKind::Reposition => "reposition",
            IncidentKind::Frozen => "frozen",
            IncidentKind::Blackout => "blackout",
            IncidentKind::MajorTamper => "major_tamper",
            IncidentKind::CaptureLost => "capture_lost",
        }
    }
}

impl From<SignalKind> for IncidentKind {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Blur => IncidentKind::Blur,
            SignalKind::Shake => IncidentKind::Shake,
            SignalKind::Glare => IncidentKind::Glare,
            SignalKind::Reposition => IncidentKind::Reposition,
            SignalKind::Frozen => IncidentKind::Frozen,
            SignalKind::Blackout => IncidentKind::Blackout,
            SignalKind::MajorTamper => IncidentKind::MajorTamper,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{
        CaptureSettings, GlareRescueMode, KernelConfig, SensorToggles, Thresholds,
    };

    pub fn base_config() -> KernelConfig {
        KernelConfig {
            db_path: ":memory:".to_string(),
            snapshot_dir: std::env::temp_dir().join("sentinel_test_snapshots"),
            capture: CaptureSettings {
                source: "stub://test".to_string(),
                target_fps: 30,
                width: 64,
                height: 64,
                warmup_frames: 0,
            },
            thresholds: Thresholds::default(),
            toggles: SensorToggles::default(),
            glare_rescue_mode: GlareRescueMode::Clahe,
            watermark_secret: "unit-test-watermark-secret".to_string(),
            queue_capacity: 1024,
        }
    }

    #[test]
    fn incident_kind_round_trips_names() {
        use crate::IncidentKind;
        assert_eq!(IncidentKind::MajorTamper.as_str(), "major_tamper");
        assert_eq!(IncidentKind::CaptureLost.as_str(), "capture_lost");
    }
}
