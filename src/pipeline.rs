//! The single-writer frame loop.
//!
//! One producer thread owns the capture source and advances every stage in
//! order: preprocess, detector bank, temporal aggregation, enhancement,
//! watermark, publish/sink/persist. Nothing here suspends; shutdown is
//! cooperative through a stop flag checked between frames, and the control
//! surface talks to the loop only through atomics and a lock-guarded
//! toggle snapshot.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::aggregate::{Aggregator, Incident, IncidentTransition};
use crate::capture::CaptureSource;
use crate::config::{GlareRescueMode, KernelConfig, SensorToggles};
use crate::detect::{BlurDetector, DetectorBank, GlareDetector, SignalAux, SignalKind};
use crate::frame::{BufferPool, Frame};
use crate::sink::{DetectionRecord, EventQueue, SinkEvent};
use crate::storage::IncidentStore;
use crate::watermark::{WatermarkEmbedder, WatermarkKey};
use crate::IncidentKind;

/// Consecutive capture failures tolerated before the feed is declared lost.
const CAPTURE_RETRIES: u32 = 3;
/// Grace period after the first failure before the pipeline gives up.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// How the frame loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// End of stream or requested stop.
    Completed,
    /// The capture source failed persistently.
    CaptureLost,
}

/// A frame snapshot published to the transport layer.
#[derive(Clone)]
pub struct PublishedFrame {
    pub timestamp_s: f64,
    pub width: u32,
    pub height: u32,
    pub rgb: Arc<Vec<u8>>,
}

struct Shared {
    toggles: RwLock<SensorToggles>,
    stop: AtomicBool,
    dismiss_reposition: AtomicBool,
    queue: EventQueue,
    raw_frame: Mutex<Option<PublishedFrame>>,
    processed_frame: Mutex<Option<PublishedFrame>>,
}

/// Cloneable control surface for the transport/UI layer.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Replace the sensor enable flags; the pipeline picks the new snapshot
    /// up at the top of its next frame.
    pub fn configure_sensors(&self, toggles: SensorToggles) {
        match self.shared.toggles.write() {
            Ok(mut guard) => *guard = toggles,
            Err(poisoned) => *poisoned.into_inner() = toggles,
        }
    }

    pub fn sensors(&self) -> SensorToggles {
        match self.shared.toggles.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Acknowledge a reposition alert: the ring buffer clears and the
    /// detector returns to idle on the next frame.
    pub fn dismiss_reposition_alert(&self) {
        self.shared.dismiss_reposition.store(true, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn next_event(&self) -> Option<SinkEvent> {
        self.shared.queue.pop()
    }

    pub fn drain_events(&self) -> Vec<SinkEvent> {
        self.shared.queue.drain()
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.queue.dropped()
    }

    pub fn latest_raw(&self) -> Option<PublishedFrame> {
        match self.shared.raw_frame.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn latest_processed(&self) -> Option<PublishedFrame> {
        match self.shared.processed_frame.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct Pipeline {
    bank: DetectorBank,
    aggregator: Aggregator,
    embedder: WatermarkEmbedder,
    store: Option<IncidentStore>,
    shared: Arc<Shared>,
    pool: BufferPool,
    prev_gray: Option<Vec<u8>>,
    rescue_mode: GlareRescueMode,
    warmup_frames: u32,
    snapshot_dir: PathBuf,
    capture_grace: Duration,
    frames_processed: u64,
}

impl Pipeline {
    pub fn new(config: &KernelConfig, store: Option<IncidentStore>) -> Result<Self> {
        let key = WatermarkKey::new(&config.watermark_secret)?;
        let start_id = match &store {
            Some(store) => store.max_incident_id().unwrap_or(0) + 1,
            None => 1,
        };
        Ok(Self {
            bank: DetectorBank::new(&config.thresholds),
            aggregator: Aggregator::with_start_id(start_id),
            embedder: WatermarkEmbedder::new(key),
            store,
            shared: Arc::new(Shared {
                toggles: RwLock::new(config.toggles),
                stop: AtomicBool::new(false),
                dismiss_reposition: AtomicBool::new(false),
                queue: EventQueue::new(config.queue_capacity),
                raw_frame: Mutex::new(None),
                processed_frame: Mutex::new(None),
            }),
            pool: BufferPool::default(),
            prev_gray: None,
            rescue_mode: config.glare_rescue_mode,
            warmup_frames: config.capture.warmup_frames,
            snapshot_dir: config.snapshot_dir.clone(),
            capture_grace: CAPTURE_GRACE,
            frames_processed: 0,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Drive the loop until end of stream, a stop request, or capture loss.
    /// The source must already be connected.
    pub fn run(&mut self, source: &mut dyn CaptureSource) -> Result<ExitStatus> {
        // Discard warm-up frames so exposure transients never become the
        // liveness reference.
        for _ in 0..self.warmup_frames {
            match source.next_frame(&mut self.pool) {
                Ok(Some(frame)) => self.pool.release(frame.into_buffer()),
                Ok(None) => return Ok(ExitStatus::Completed),
                Err(e) => log::warn!("warm-up capture error: {e}"),
            }
        }

        let mut failures = 0u32;
        let mut first_failure: Option<Instant> = None;
        let mut capture_lost_raised = false;

        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }

            let frame = match source.next_frame(&mut self.pool) {
                Ok(Some(frame)) => {
                    failures = 0;
                    first_failure = None;
                    capture_lost_raised = false;
                    frame
                }
                Ok(None) => break,
                Err(e) => {
                    failures += 1;
                    let since = *first_failure.get_or_insert_with(Instant::now);
                    log::warn!("capture error ({failures}): {e}");
                    if failures >= CAPTURE_RETRIES && !capture_lost_raised {
                        capture_lost_raised = true;
                        self.raise_capture_lost(&format!("{e}"));
                    }
                    if capture_lost_raised && since.elapsed() >= self.capture_grace {
                        self.drain_on_exit();
                        return Ok(ExitStatus::CaptureLost);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
            };

            self.process_frame(frame)?;
        }

        self.drain_on_exit();
        Ok(ExitStatus::Completed)
    }

    /// Run every stage for one frame. Public to let scripted frame sequences
    /// drive the pipeline directly in tests and tools.
    pub fn process_frame(&mut self, mut frame: Frame) -> Result<()> {
        let toggles = self.handle().sensors();
        let now = frame.timestamp_s;

        if self.shared.dismiss_reposition.swap(false, Ordering::SeqCst) {
            self.bank.reposition.reset();
            if let Some(transition) = self.aggregator.dismiss(SignalKind::Reposition) {
                self.persist_transition(&transition, now, &toggles);
                self.shared.queue.push(SinkEvent::Incident(transition));
            }
        }

        let signals = self.bank.run(&frame, self.prev_gray.as_deref(), &toggles);
        let transitions = self.aggregator.observe(&signals, now);

        // Raw stream is published before any enhancement touches the pixels.
        publish(&self.shared.raw_frame, &frame);

        // The previous-frame cache swaps only after every detector has
        // consumed it; grab the new grayscale now, before enhancement.
        let gray_snapshot = frame.gray().to_vec();

        let glare_tripped = signals
            .iter()
            .any(|s| s.kind == SignalKind::Glare && s.tripped);
        let blur_tripped = signals
            .iter()
            .any(|s| s.kind == SignalKind::Blur && s.tripped);

        if glare_tripped && toggles.glare_rescue && self.rescue_mode == GlareRescueMode::Clahe {
            frame.replace_rgb(GlareDetector::rescued(&frame))?;
        }
        if blur_tripped && toggles.blur_fix {
            frame.replace_rgb(BlurDetector::corrected(&frame))?;
        }

        self.embedder.embed(&mut frame);

        for transition in &transitions {
            if let IncidentTransition::Opened(incident) = transition {
                if incident.kind == IncidentKind::Glare {
                    self.save_glare_snapshot(&frame, incident, &signals);
                }
            }
        }

        publish(&self.shared.processed_frame, &frame);

        self.shared.queue.push(SinkEvent::Detections(DetectionRecord {
            timestamp_s: now,
            signals,
        }));
        for transition in transitions {
            self.persist_transition(&transition, now, &toggles);
            self.shared.queue.push(SinkEvent::Incident(transition));
        }

        self.prev_gray = Some(gray_snapshot);
        self.frames_processed += 1;
        self.pool.release(frame.into_buffer());
        Ok(())
    }

    /// Best-effort persistence; storage failures never stall the loop.
    fn persist_transition(&mut self, transition: &IncidentTransition, now: f64, toggles: &SensorToggles) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let incident = transition.incident();
        if let Err(e) = store.upsert_incident(incident) {
            log::warn!("incident write failed (id {}): {e}", incident.id);
        }
        if toggles.audio_alerts {
            if let IncidentTransition::Opened(incident) = transition {
                if let Err(e) = store.record_audio_log(Some(incident.id), &incident.description, now)
                {
                    log::warn!("audio log write failed: {e}");
                }
            }
        }
    }

    fn save_glare_snapshot(&mut self, frame: &Frame, incident: &Incident, signals: &[crate::detect::DetectionSignal]) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let bright_pct = signals
            .iter()
            .find_map(|s| match &s.aux {
                SignalAux::Glare { bright_pct, .. } if s.kind == SignalKind::Glare => {
                    Some(*bright_pct)
                }
                _ => None,
            })
            .unwrap_or(0.0);

        if let Err(e) = std::fs::create_dir_all(&self.snapshot_dir) {
            log::warn!("glare snapshot dir unavailable: {e}");
            return;
        }
        let path = self
            .snapshot_dir
            .join(format!("glare_{}_{}.png", incident.id, frame.timestamp_s as i64));
        let saved = image::RgbImage::from_raw(frame.width, frame.height, frame.rgb().to_vec())
            .map(|img| img.save(&path));
        match saved {
            Some(Ok(())) => {
                if let Err(e) = store.record_glare_image(
                    Some(incident.id),
                    &path.to_string_lossy(),
                    bright_pct,
                    frame.timestamp_s,
                ) {
                    log::warn!("glare image row write failed: {e}");
                }
            }
            Some(Err(e)) => log::warn!("glare snapshot encode failed: {e}"),
            None => log::warn!("glare snapshot buffer size mismatch"),
        }
    }

    fn raise_capture_lost(&mut self, reason: &str) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let incident = Incident {
            id: self.aggregator.allocate_id(),
            kind: IncidentKind::CaptureLost,
            subtype: String::new(),
            first_seen_ts: now,
            last_seen_ts: now,
            count: 1,
            description: format!("capture device lost: {reason}"),
        };
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.upsert_incident(&incident) {
                log::warn!("capture-lost incident write failed: {e}");
            }
        }
        self.shared
            .queue
            .push(SinkEvent::Incident(IncidentTransition::Opened(incident)));
    }

    fn drain_on_exit(&mut self) {
        let pending = self.shared.queue.len();
        if pending > 0 {
            log::info!("shutdown with {pending} undelivered events");
        }
        let dropped = self.shared.queue.dropped();
        if dropped > 0 {
            log::info!("{dropped} events dropped under backpressure this run");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_capture_grace(&mut self, grace: Duration) {
        self.capture_grace = grace;
    }
}

fn publish(slot: &Mutex<Option<PublishedFrame>>, frame: &Frame) {
    let published = PublishedFrame {
        timestamp_s: frame.timestamp_s,
        width: frame.width,
        height: frame.height,
        rgb: Arc::new(frame.rgb().to_vec()),
    };
    match slot.lock() {
        Ok(mut guard) => *guard = Some(published),
        Err(poisoned) => *poisoned.into_inner() = Some(published),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use anyhow::anyhow;

    fn test_config() -> KernelConfig {
        let mut cfg = crate::test_support::base_config();
        cfg.capture.warmup_frames = 0;
        cfg
    }

    struct FailingSource;

    impl CaptureSource for FailingSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn next_frame(&mut self, _pool: &mut BufferPool) -> Result<Option<Frame>> {
            Err(anyhow!("device unplugged"))
        }
    }

    struct CountedSource {
        remaining: u32,
    }

    impl CaptureSource for CountedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn next_frame(&mut self, _pool: &mut BufferPool) -> Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Frame::new(100.0, 64, 64, vec![128u8; 64 * 64 * 3]).map(Some)
        }
    }

    #[test]
    fn run_completes_at_end_of_stream() -> Result<()> {
        let cfg = test_config();
        let mut pipeline = Pipeline::new(&cfg, None)?;
        let mut source = CountedSource { remaining: 5 };
        let status = pipeline.run(&mut source)?;
        assert_eq!(status, ExitStatus::Completed);
        assert_eq!(pipeline.frames_processed(), 5);
        Ok(())
    }

    #[test]
    fn persistent_capture_failure_raises_incident_and_exits() -> Result<()> {
        let cfg = test_config();
        let mut pipeline = Pipeline::new(&cfg, None)?;
        pipeline.set_capture_grace(Duration::from_millis(120));
        let handle = pipeline.handle();

        let status = pipeline.run(&mut FailingSource)?;
        assert_eq!(status, ExitStatus::CaptureLost);

        let events = handle.drain_events();
        let capture_lost = events.iter().any(|e| match e {
            SinkEvent::Incident(t) => t.incident().kind == IncidentKind::CaptureLost,
            _ => false,
        });
        assert!(capture_lost, "capture_lost incident must be emitted");
        Ok(())
    }

    #[test]
    fn stop_flag_ends_the_loop() -> Result<()> {
        let cfg = test_config();
        let mut pipeline = Pipeline::new(&cfg, None)?;
        pipeline.handle().request_stop();
        let mut source = CountedSource { remaining: 1000 };
        let status = pipeline.run(&mut source)?;
        assert_eq!(status, ExitStatus::Completed);
        assert_eq!(pipeline.frames_processed(), 0);
        Ok(())
    }

    #[test]
    fn configure_sensors_takes_effect_next_frame() -> Result<()> {
        let cfg = test_config();
        let mut pipeline = Pipeline::new(&cfg, None)?;
        let handle = pipeline.handle();

        let mut toggles = handle.sensors();
        toggles.blur = false;
        handle.configure_sensors(toggles);

        pipeline.process_frame(Frame::new(1.0, 64, 64, vec![128u8; 64 * 64 * 3])?)?;
        let event = handle.next_event().expect("detections record");
        match event {
            SinkEvent::Detections(record) => {
                let blur = record
                    .signals
                    .iter()
                    .find(|s| s.kind == SignalKind::Blur)
                    .unwrap();
                assert!(!blur.tripped, "disabled blur detector must stay quiet");
            }
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn raw_and_processed_frames_are_published() -> Result<()> {
        let cfg = test_config();
        let mut pipeline = Pipeline::new(&cfg, None)?;
        let handle = pipeline.handle();
        pipeline.process_frame(Frame::new(1000.0, 64, 64, vec![128u8; 64 * 64 * 3])?)?;

        let raw = handle.latest_raw().expect("raw frame");
        let processed = handle.latest_processed().expect("processed frame");
        assert_eq!(raw.width, 64);
        // The processed stream carries the watermark; the raw stream does not.
        assert_ne!(raw.rgb.as_slice(), processed.rgb.as_slice());
        Ok(())
    }
}
