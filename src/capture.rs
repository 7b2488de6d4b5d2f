//! Frame sources feeding the pipeline.
//!
//! Two implementations: a deterministic synthetic source (`stub://` URLs)
//! for tests and bench runs, and a still-image directory source for replayed
//! footage. Both stamp wall-clock capture timestamps and draw their pixel
//! buffers from the shared pool.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::CaptureSettings;
use crate::frame::{BufferPool, Frame, CHANNELS};

/// A blocking producer of timestamped frames. `Ok(None)` signals a clean
/// end of stream.
pub trait CaptureSource {
    fn connect(&mut self) -> Result<()>;
    fn next_frame(&mut self, pool: &mut BufferPool) -> Result<Option<Frame>>;
}

/// Build a source from the configured descriptor: `stub://` selects the
/// synthetic generator, anything else is treated as a frame directory.
pub fn open_source(settings: &CaptureSettings) -> Result<Box<dyn CaptureSource>> {
    if settings.source.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::new(settings.clone())))
    } else {
        Ok(Box::new(FileSource::new(
            PathBuf::from(&settings.source),
            settings.target_fps,
        )))
    }
}

fn now_s() -> Result<f64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .map_err(|e| anyhow!("system clock before epoch: {e}"))
}

// ---------------------------------------------------------------------------
// Synthetic source
// ---------------------------------------------------------------------------

/// Deterministic gradient scene with per-frame sensor noise, so the liveness
/// detector sees a live (not frozen) feed.
pub struct SyntheticSource {
    settings: CaptureSettings,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            frame_count: 0,
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("capture: connected to {} (synthetic)", self.settings.source);
        Ok(())
    }

    fn next_frame(&mut self, pool: &mut BufferPool) -> Result<Option<Frame>> {
        self.frame_count += 1;
        let w = self.settings.width as usize;
        let h = self.settings.height as usize;
        let mut rgb = pool.acquire(w * h * CHANNELS);

        let mut rng = rand::thread_rng();
        for y in 0..h {
            for x in 0..w {
                let base = ((x * 255 / w + y * 255 / h) / 2) as u8;
                let noise: i16 = rng.gen_range(-6..=6);
                let level = (base as i16 + noise).clamp(0, 255) as u8;
                let i = (y * w + x) * CHANNELS;
                rgb[i] = level;
                rgb[i + 1] = level;
                rgb[i + 2] = level.saturating_add(10);
            }
        }

        Frame::new(now_s()?, self.settings.width, self.settings.height, rgb).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Still-image directory source
// ---------------------------------------------------------------------------

/// Plays a directory of still frames (sorted by file name) at a fixed rate.
/// Frames are timestamped against the wall clock from the moment of
/// connection.
pub struct FileSource {
    dir: PathBuf,
    fps: u32,
    paths: Vec<PathBuf>,
    cursor: usize,
    started_at_s: f64,
}

impl FileSource {
    pub fn new(dir: PathBuf, fps: u32) -> Self {
        Self {
            dir,
            fps: fps.max(1),
            paths: Vec::new(),
            cursor: 0,
            started_at_s: 0.0,
        }
    }
}

impl CaptureSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("open frame directory {}", self.dir.display()))?;
        self.paths = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("png") | Some("jpg") | Some("jpeg") | Some("bmp")
                )
            })
            .collect();
        self.paths.sort();
        if self.paths.is_empty() {
            return Err(anyhow!("no frame images in {}", self.dir.display()));
        }
        self.started_at_s = now_s()?;
        log::info!(
            "capture: connected to {} ({} frames)",
            self.dir.display(),
            self.paths.len()
        );
        Ok(())
    }

    fn next_frame(&mut self, pool: &mut BufferPool) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.cursor) else {
            return Ok(None);
        };
        let decoded = image::open(path)
            .with_context(|| format!("decode frame {}", path.display()))?
            .to_rgb8();
        let (w, h) = decoded.dimensions();

        let mut rgb = pool.acquire(w as usize * h as usize * CHANNELS);
        rgb.copy_from_slice(decoded.as_raw());

        let ts = self.started_at_s + self.cursor as f64 / self.fps as f64;
        self.cursor += 1;
        Frame::new(ts, w, h, rgb).map(Some)
    }
}
