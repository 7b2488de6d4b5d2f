//! Kernel configuration: detection thresholds, sensor toggles, capture
//! settings, and the watermark secret.
//!
//! Defaults are compiled in; an optional JSON file named by
//! `SENTINEL_CONFIG` overrides them, and `SENTINEL_*` environment variables
//! override the file. `validate()` failures are fatal at load (daemon exit
//! code 2). Thresholds are immutable after load; only `SensorToggles` can
//! change at runtime through the control surface.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::watermark::{DEV_SECRET, MIN_SECRET_LEN};

const DEFAULT_DB_PATH: &str = "sentinel.db";
const DEFAULT_SNAPSHOT_DIR: &str = "glare_snapshots";
const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_WARMUP_FRAMES: u32 = 30;
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Detection and validation thresholds. Immutable after load.
#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
    pub blur: f64,
    pub shake: f64,
    pub reposition: f64,
    pub fast_reposition: f64,
    pub direction_consistency: f64,
    pub liveness: f64,
    pub liveness_check_interval_s: f64,
    pub liveness_activation_s: f64,
    pub blackout_brightness: f64,
    pub major_tamper: f64,
    pub live_threshold: f64,
    pub color_match_distance: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            blur: 70.0,
            shake: 6.0,
            reposition: 10.0,
            fast_reposition: 20.0,
            direction_consistency: 0.4,
            liveness: 2.0,
            liveness_check_interval_s: 3.0,
            liveness_activation_s: 10.0,
            blackout_brightness: 25.0,
            major_tamper: 60.0,
            live_threshold: 0.70,
            color_match_distance: 24.0,
        }
    }
}

/// Per-detector enable flags plus enhancement switches. Runtime-mutable
/// through the control surface; the pipeline snapshots this once per frame.
#[derive(Clone, Copy, Debug)]
pub struct SensorToggles {
    pub blur: bool,
    pub shake: bool,
    pub glare: bool,
    pub liveness: bool,
    pub reposition: bool,
    pub blur_fix: bool,
    pub glare_rescue: bool,
    pub audio_alerts: bool,
}

impl Default for SensorToggles {
    fn default() -> Self {
        Self {
            blur: true,
            shake: true,
            glare: true,
            liveness: true,
            reposition: true,
            blur_fix: true,
            glare_rescue: true,
            audio_alerts: false,
        }
    }
}

/// Glare rescue algorithm. One mode today; the variant leaves room for more.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GlareRescueMode {
    #[default]
    Clahe,
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Source descriptor: `stub://...` for the synthetic source, otherwise a
    /// directory of still frames.
    pub source: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: u32,
}

#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub capture: CaptureSettings,
    pub thresholds: Thresholds,
    pub toggles: SensorToggles,
    pub glare_rescue_mode: GlareRescueMode,
    pub watermark_secret: String,
    pub queue_capacity: usize,
}

// --------------------------- file mirror types ---------------------------

#[derive(Debug, Deserialize, Default)]
struct KernelConfigFile {
    db_path: Option<String>,
    snapshot_dir: Option<PathBuf>,
    capture: Option<CaptureFile>,
    thresholds: Option<ThresholdsFile>,
    sensors: Option<SensorsFile>,
    watermark: Option<WatermarkFile>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureFile {
    source: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    warmup_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdsFile {
    blur: Option<f64>,
    shake: Option<f64>,
    reposition: Option<f64>,
    fast_reposition: Option<f64>,
    direction_consistency: Option<f64>,
    liveness: Option<f64>,
    liveness_check_interval: Option<f64>,
    liveness_activation_time: Option<f64>,
    blackout_brightness: Option<f64>,
    major_tamper: Option<f64>,
    live_threshold: Option<f64>,
    color_match_distance: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SensorsFile {
    blur: Option<bool>,
    shake: Option<bool>,
    glare: Option<bool>,
    liveness: Option<bool>,
    reposition: Option<bool>,
    blur_fix: Option<bool>,
    glare_rescue: Option<bool>,
    glare_rescue_mode: Option<String>,
    audio_alerts: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct WatermarkFile {
    secret: Option<String>,
}

impl KernelConfig {
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("SENTINEL_CONFIG").ok().as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => KernelConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KernelConfigFile) -> Result<Self> {
        let defaults = Thresholds::default();
        let t = file.thresholds.unwrap_or_default();
        let thresholds = Thresholds {
            blur: t.blur.unwrap_or(defaults.blur),
            shake: t.shake.unwrap_or(defaults.shake),
            reposition: t.reposition.unwrap_or(defaults.reposition),
            fast_reposition: t.fast_reposition.unwrap_or(defaults.fast_reposition),
            direction_consistency: t
                .direction_consistency
                .unwrap_or(defaults.direction_consistency),
            liveness: t.liveness.unwrap_or(defaults.liveness),
            liveness_check_interval_s: t
                .liveness_check_interval
                .unwrap_or(defaults.liveness_check_interval_s),
            liveness_activation_s: t
                .liveness_activation_time
                .unwrap_or(defaults.liveness_activation_s),
            blackout_brightness: t
                .blackout_brightness
                .unwrap_or(defaults.blackout_brightness),
            major_tamper: t.major_tamper.unwrap_or(defaults.major_tamper),
            live_threshold: t.live_threshold.unwrap_or(defaults.live_threshold),
            color_match_distance: t
                .color_match_distance
                .unwrap_or(defaults.color_match_distance),
        };

        let s = file.sensors.unwrap_or_default();
        let toggle_defaults = SensorToggles::default();
        let toggles = SensorToggles {
            blur: s.blur.unwrap_or(toggle_defaults.blur),
            shake: s.shake.unwrap_or(toggle_defaults.shake),
            glare: s.glare.unwrap_or(toggle_defaults.glare),
            liveness: s.liveness.unwrap_or(toggle_defaults.liveness),
            reposition: s.reposition.unwrap_or(toggle_defaults.reposition),
            blur_fix: s.blur_fix.unwrap_or(toggle_defaults.blur_fix),
            glare_rescue: s.glare_rescue.unwrap_or(toggle_defaults.glare_rescue),
            audio_alerts: s.audio_alerts.unwrap_or(toggle_defaults.audio_alerts),
        };
        let glare_rescue_mode = match s.glare_rescue_mode.as_deref() {
            None => GlareRescueMode::Clahe,
            Some(mode) => parse_rescue_mode(mode)?,
        };

        let c = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            source: c.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            target_fps: c.target_fps.unwrap_or(DEFAULT_FPS),
            width: c.width.unwrap_or(DEFAULT_WIDTH),
            height: c.height.unwrap_or(DEFAULT_HEIGHT),
            warmup_frames: c.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            snapshot_dir: file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            capture,
            thresholds,
            toggles,
            glare_rescue_mode,
            watermark_secret: file
                .watermark
                .and_then(|w| w.secret)
                .unwrap_or_else(|| DEV_SECRET.to_string()),
            queue_capacity: file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SENTINEL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(source) = std::env::var("SENTINEL_SOURCE") {
            if !source.trim().is_empty() {
                self.capture.source = source;
            }
        }
        if let Ok(secret) = std::env::var("SENTINEL_WATERMARK_KEY") {
            if !secret.trim().is_empty() {
                self.watermark_secret = secret;
            }
        }
        if let Ok(fps) = std::env::var("SENTINEL_TARGET_FPS") {
            self.capture.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("SENTINEL_TARGET_FPS must be an integer"))?;
        }
        if let Ok(warmup) = std::env::var("SENTINEL_WARMUP_FRAMES") {
            self.capture.warmup_frames = warmup
                .parse()
                .map_err(|_| anyhow!("SENTINEL_WARMUP_FRAMES must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.watermark_secret.len() < MIN_SECRET_LEN {
            return Err(anyhow!(
                "watermark secret must be at least {MIN_SECRET_LEN} bytes"
            ));
        }
        if !self.watermark_secret.is_ascii() {
            return Err(anyhow!("watermark secret must be ASCII"));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture target_fps must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture dimensions must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than zero"));
        }
        let t = &self.thresholds;
        if t.live_threshold <= 0.0 || t.live_threshold > 1.0 {
            return Err(anyhow!("live_threshold must be in (0, 1]"));
        }
        if t.color_match_distance <= 0.0 {
            return Err(anyhow!("color_match_distance must be positive"));
        }
        if t.liveness_check_interval_s <= 0.0 || t.liveness_activation_s < 0.0 {
            return Err(anyhow!("liveness intervals must be positive"));
        }
        Ok(())
    }
}

fn parse_rescue_mode(mode: &str) -> Result<GlareRescueMode> {
    match mode.to_ascii_uppercase().as_str() {
        "CLAHE" => Ok(GlareRescueMode::Clahe),
        other => Err(anyhow!("unknown glare rescue mode '{other}'")),
    }
}

fn read_config_file(path: &Path) -> Result<KernelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {e}", path.display()))
}
