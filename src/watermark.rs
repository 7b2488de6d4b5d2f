//! Time-keyed watermark: embedder and offline validator.
//!
//! Every outgoing frame carries a solid color square whose RGB value is the
//! first three bytes of `HMAC-SHA256(secret, ascii_decimal(unix_second))`.
//! The token is unforgeable without the key, changes every wall second, and
//! is identical across embedder and validator for the same `(secret, second)`
//! pair. A replayed recording embeds tokens for the seconds it was captured,
//! so any validator clock that disagrees with the recording's own timeline
//! rejects it.

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::path::Path;
use zeroize::Zeroize;

use crate::frame::{Frame, CHANNELS};

type HmacSha256 = Hmac<Sha256>;

/// Side of the solid watermark square, in pixels.
pub const WATERMARK_SIZE: u32 = 40;
/// Inset of the square from the bottom and right frame edges.
pub const WATERMARK_INSET: u32 = 10;
/// Minimum accepted secret length.
pub const MIN_SECRET_LEN: usize = 16;

/// Development-only default secret. Production deployments must supply the
/// key through configuration; it never appears on the wire.
pub const DEV_SECRET: &str = "sentinel-dev-watermark-secret";

/// Validated watermark secret. Key material is zeroized on drop.
pub struct WatermarkKey {
    mac: HmacSha256,
}

impl WatermarkKey {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(anyhow!(
                "watermark secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                secret.len()
            ));
        }
        if !secret.is_ascii() {
            return Err(anyhow!("watermark secret must be ASCII"));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("watermark key rejected: {e}"))?;
        Ok(Self { mac })
    }

    /// RGB token for the given integer Unix second. Deterministic across
    /// runs and across embedder/validator.
    pub fn token(&self, unix_second: i64) -> [u8; 3] {
        let mut mac = self.mac.clone();
        mac.update(unix_second.to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        [digest[0], digest[1], digest[2]]
    }
}

impl Drop for WatermarkKey {
    fn drop(&mut self) {
        // Hmac's internal state is key-derived; overwrite it with a
        // throwaway instance keyed on zeros before the memory is freed.
        let mut scrub = [0u8; 32];
        if let Ok(blank) = HmacSha256::new_from_slice(&scrub) {
            self.mac = blank;
        }
        scrub.zeroize();
    }
}

/// Paints the per-second token onto outgoing frames.
///
/// The token is derived at most once per wall second; within a second the
/// cached color is reused.
pub struct WatermarkEmbedder {
    key: WatermarkKey,
    cached: Option<(i64, [u8; 3])>,
}

impl WatermarkEmbedder {
    pub fn new(key: WatermarkKey) -> Self {
        Self { key, cached: None }
    }

    /// Stamp the frame for its own capture timestamp. Frames too small to
    /// hold the square pass through unmarked.
    pub fn embed(&mut self, frame: &mut Frame) {
        let second = frame.timestamp_s.floor() as i64;
        let token = match self.cached {
            Some((cached_second, color)) if cached_second == second => color,
            _ => {
                let color = self.key.token(second);
                self.cached = Some((second, color));
                color
            }
        };

        let (width, height) = (frame.width, frame.height);
        if width < WATERMARK_SIZE + WATERMARK_INSET || height < WATERMARK_SIZE + WATERMARK_INSET {
            return;
        }
        let x0 = (width - WATERMARK_INSET - WATERMARK_SIZE) as usize;
        let y0 = (height - WATERMARK_INSET - WATERMARK_SIZE) as usize;
        let row = width as usize * CHANNELS;
        let rgb = frame.rgb_mut();
        for y in y0..y0 + WATERMARK_SIZE as usize {
            for x in x0..x0 + WATERMARK_SIZE as usize {
                let i = y * row + x * CHANNELS;
                rgb[i] = token[0];
                rgb[i + 1] = token[1];
                rgb[i + 2] = token[2];
            }
        }
    }
}

/// Mean color of the watermark region. Averaging defeats compression noise.
pub fn observed_token(rgb: &[u8], width: u32, height: u32) -> Option<[f64; 3]> {
    if width < WATERMARK_SIZE + WATERMARK_INSET || height < WATERMARK_SIZE + WATERMARK_INSET {
        return None;
    }
    let x0 = (width - WATERMARK_INSET - WATERMARK_SIZE) as usize;
    let y0 = (height - WATERMARK_INSET - WATERMARK_SIZE) as usize;
    let row = width as usize * CHANNELS;
    let mut sums = [0.0f64; 3];
    for y in y0..y0 + WATERMARK_SIZE as usize {
        for x in x0..x0 + WATERMARK_SIZE as usize {
            let i = y * row + x * CHANNELS;
            sums[0] += rgb[i] as f64;
            sums[1] += rgb[i + 1] as f64;
            sums[2] += rgb[i + 2] as f64;
        }
    }
    let n = (WATERMARK_SIZE * WATERMARK_SIZE) as f64;
    Some([sums[0] / n, sums[1] / n, sums[2] / n])
}

// ---------------------------------------------------------------------------
// Offline validator
// ---------------------------------------------------------------------------

/// The clock the validator checks the recording against.
#[derive(Clone, Copy, Debug)]
pub enum ValidatorClock {
    /// Trust each frame's own timestamp.
    Embedded,
    /// Rebase the recording onto this start second (first frame maps here,
    /// later frames keep their relative offsets).
    FixedStart(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Live,
    NotLive,
    Error,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Live => "LIVE",
            ValidationStatus::NotLive => "NOT_LIVE",
            ValidationStatus::Error => "ERROR",
        }
    }
}

/// Per-frame audit entry.
#[derive(Clone, Debug, Serialize)]
pub struct FrameCheck {
    pub index: usize,
    pub checked_second: i64,
    pub expected: [u8; 3],
    pub observed: Option<[f64; 3]>,
    pub distance: Option<f64>,
    pub matched: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub match_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub frames: Vec<FrameCheck>,
}

impl ValidationReport {
    fn error(reason: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Error,
            match_rate: 0.0,
            error: Some(reason.into()),
            frames: Vec::new(),
        }
    }
}

/// Validation tolerances, configurable alongside the detector thresholds.
#[derive(Clone, Copy, Debug)]
pub struct ValidationTolerances {
    /// Maximum Euclidean RGB distance still counted as a match.
    pub color_match_distance: f64,
    /// Minimum match rate for a LIVE verdict.
    pub live_threshold: f64,
}

impl Default for ValidationTolerances {
    fn default() -> Self {
        Self {
            color_match_distance: 24.0,
            live_threshold: 0.70,
        }
    }
}

/// Check a decoded frame sequence against the expected token timeline.
pub fn validate_frames(
    key: &WatermarkKey,
    frames: &[Frame],
    clock: ValidatorClock,
    tolerances: ValidationTolerances,
) -> ValidationReport {
    if frames.is_empty() {
        return ValidationReport::error("recording contains no frames");
    }

    let base_ts = frames[0].timestamp_s;
    let mut checks = Vec::with_capacity(frames.len());
    let mut matches = 0usize;

    for (index, frame) in frames.iter().enumerate() {
        let effective_ts = match clock {
            ValidatorClock::Embedded => frame.timestamp_s,
            ValidatorClock::FixedStart(start) => start + (frame.timestamp_s - base_ts),
        };
        let checked_second = effective_ts.floor() as i64;
        let expected = key.token(checked_second);

        let observed = observed_token(frame.rgb(), frame.width, frame.height);
        let distance = observed.map(|obs| {
            let dr = obs[0] - expected[0] as f64;
            let dg = obs[1] - expected[1] as f64;
            let db = obs[2] - expected[2] as f64;
            (dr * dr + dg * dg + db * db).sqrt()
        });
        let matched = distance.map(|d| d < tolerances.color_match_distance).unwrap_or(false);
        if matched {
            matches += 1;
        }
        checks.push(FrameCheck {
            index,
            checked_second,
            expected,
            observed,
            distance,
            matched,
        });
    }

    let match_rate = matches as f64 / checks.len() as f64;
    ValidationReport {
        status: if match_rate >= tolerances.live_threshold {
            ValidationStatus::Live
        } else {
            ValidationStatus::NotLive
        },
        match_rate,
        error: None,
        frames: checks,
    }
}

/// Validate a recording stored as a directory of still frames (sorted by
/// file name) captured at `fps` starting at `start_timestamp_s`.
///
/// Input problems produce an `ERROR` report with a reason string; this
/// function never propagates an error to the caller.
pub fn validate_recording(
    key: &WatermarkKey,
    dir: &Path,
    start_timestamp_s: f64,
    fps: f64,
    clock: ValidatorClock,
    tolerances: ValidationTolerances,
) -> ValidationReport {
    if fps <= 0.0 {
        return ValidationReport::error("fps must be positive");
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return ValidationReport::error(format!("unreadable recording {}: {e}", dir.display())),
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("png") | Some("jpg") | Some("jpeg") | Some("bmp")
            )
        })
        .collect();
    paths.sort();
    if paths.is_empty() {
        return ValidationReport::error(format!("no frame images in {}", dir.display()));
    }

    let mut frames = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        let decoded = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                return ValidationReport::error(format!("undecodable frame {}: {e}", path.display()))
            }
        };
        let (w, h) = decoded.dimensions();
        let ts = start_timestamp_s + i as f64 / fps;
        match Frame::new(ts, w, h, decoded.into_raw()) {
            Ok(frame) => frames.push(frame),
            Err(e) => return ValidationReport::error(format!("bad frame {}: {e}", path.display())),
        }
    }

    validate_frames(key, &frames, clock, tolerances)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-0123456789";

    fn key() -> WatermarkKey {
        WatermarkKey::new(SECRET).unwrap()
    }

    fn blank_frame(ts: f64) -> Frame {
        Frame::new(ts, 160, 120, vec![40u8; 160 * 120 * 3]).unwrap()
    }

    #[test]
    fn rejects_short_secret() {
        assert!(WatermarkKey::new("short").is_err());
        assert!(WatermarkKey::new(SECRET).is_ok());
    }

    #[test]
    fn token_is_deterministic_per_second() {
        let a = key();
        let b = key();
        assert_eq!(a.token(1_700_000_000), b.token(1_700_000_000));
        assert_ne!(a.token(1_700_000_000), a.token(1_700_000_001));
    }

    #[test]
    fn embedded_region_averages_to_exact_token() {
        let k = key();
        let expected = k.token(1_700_000_000);
        let mut embedder = WatermarkEmbedder::new(k);
        let mut frame = blank_frame(1_700_000_000.4);
        embedder.embed(&mut frame);

        let observed = observed_token(frame.rgb(), frame.width, frame.height).unwrap();
        assert_eq!(observed[0], expected[0] as f64);
        assert_eq!(observed[1], expected[1] as f64);
        assert_eq!(observed[2], expected[2] as f64);
    }

    #[test]
    fn token_recomputes_once_per_second() {
        let mut embedder = WatermarkEmbedder::new(key());
        let mut f1 = blank_frame(1_700_000_000.1);
        let mut f2 = blank_frame(1_700_000_000.9);
        let mut f3 = blank_frame(1_700_000_001.0);
        embedder.embed(&mut f1);
        let cached = embedder.cached;
        embedder.embed(&mut f2);
        assert_eq!(embedder.cached, cached, "same second reuses token");
        embedder.embed(&mut f3);
        assert_ne!(embedder.cached, cached, "new second derives fresh token");
    }

    #[test]
    fn tiny_frame_is_left_unmarked() {
        let mut embedder = WatermarkEmbedder::new(key());
        let mut frame = Frame::new(0.0, 20, 20, vec![9u8; 20 * 20 * 3]).unwrap();
        embedder.embed(&mut frame);
        assert!(frame.rgb().iter().all(|&p| p == 9));
    }

    #[test]
    fn lossless_roundtrip_is_live_with_full_match_rate() {
        let mut embedder = WatermarkEmbedder::new(key());
        let mut frames = Vec::new();
        for i in 0..150 {
            let mut frame = blank_frame(1_700_000_000.0 + i as f64 / 30.0);
            embedder.embed(&mut frame);
            frames.push(frame);
        }
        let report = validate_frames(
            &key(),
            &frames,
            ValidatorClock::Embedded,
            ValidationTolerances::default(),
        );
        assert_eq!(report.status, ValidationStatus::Live);
        assert_eq!(report.match_rate, 1.0);
        assert_eq!(report.frames.len(), 150);
    }

    #[test]
    fn wrong_secret_is_not_live() {
        let mut embedder = WatermarkEmbedder::new(key());
        let mut frames = Vec::new();
        for i in 0..60 {
            let mut frame = blank_frame(1_700_000_000.0 + i as f64 / 30.0);
            embedder.embed(&mut frame);
            frames.push(frame);
        }
        let other = WatermarkKey::new("another-secret-key-98765").unwrap();
        let report = validate_frames(
            &other,
            &frames,
            ValidatorClock::Embedded,
            ValidationTolerances::default(),
        );
        assert_eq!(report.status, ValidationStatus::NotLive);
    }

    #[test]
    fn replay_under_shifted_clock_is_not_live() {
        let mut embedder = WatermarkEmbedder::new(key());
        let mut frames = Vec::new();
        for i in 0..150 {
            let mut frame = blank_frame(1_700_000_000.0 + i as f64 / 30.0);
            embedder.embed(&mut frame);
            frames.push(frame);
        }
        // An hour later, checked against "now" instead of the recording's
        // own timeline.
        let report = validate_frames(
            &key(),
            &frames,
            ValidatorClock::FixedStart(1_700_003_600.0),
            ValidationTolerances::default(),
        );
        assert_eq!(report.status, ValidationStatus::NotLive);
        assert!(report.match_rate < 0.70);
    }

    #[test]
    fn empty_input_reports_error_not_panic() {
        let report = validate_frames(
            &key(),
            &[],
            ValidatorClock::Embedded,
            ValidationTolerances::default(),
        );
        assert_eq!(report.status, ValidationStatus::Error);
        assert!(report.error.is_some());
    }

    #[test]
    fn missing_recording_dir_reports_error() {
        let report = validate_recording(
            &key(),
            Path::new("/nonexistent/recording"),
            0.0,
            30.0,
            ValidatorClock::Embedded,
            ValidationTolerances::default(),
        );
        assert_eq!(report.status, ValidationStatus::Error);
    }
}
