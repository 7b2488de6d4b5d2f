//! End-to-end pipeline scenarios: synthetic footage in, incidents and
//! watermarked frames out.

use anyhow::Result;

use sentinel_kernel::config::CaptureSettings;
use sentinel_kernel::{
    validate_frames, Frame, GlareRescueMode, IncidentKind, IncidentStore, KernelConfig, Pipeline,
    SensorToggles, SinkEvent, Thresholds, ValidationStatus, ValidationTolerances, ValidatorClock,
    WatermarkKey,
};

const FPS: f64 = 30.0;
const T0: f64 = 1_700_000_000.0;
const SECRET: &str = "scenario-watermark-secret-key";

fn config() -> KernelConfig {
    KernelConfig {
        db_path: ":memory:".to_string(),
        snapshot_dir: std::env::temp_dir().join("sentinel_scenario_snapshots"),
        capture: CaptureSettings {
            source: "stub://scenario".to_string(),
            target_fps: 30,
            width: 128,
            height: 96,
            warmup_frames: 0,
        },
        thresholds: Thresholds::default(),
        toggles: SensorToggles::default(),
        glare_rescue_mode: GlareRescueMode::Clahe,
        watermark_secret: SECRET.to_string(),
        queue_capacity: 50_000,
    }
}

fn only(toggles_on: &[&str]) -> SensorToggles {
    let mut toggles = SensorToggles {
        blur: false,
        shake: false,
        glare: false,
        liveness: false,
        reposition: false,
        blur_fix: false,
        glare_rescue: false,
        audio_alerts: false,
    };
    for name in toggles_on {
        match *name {
            "blur" => toggles.blur = true,
            "shake" => toggles.shake = true,
            "glare" => toggles.glare = true,
            "liveness" => toggles.liveness = true,
            "reposition" => toggles.reposition = true,
            "blur_fix" => toggles.blur_fix = true,
            "glare_rescue" => toggles.glare_rescue = true,
            other => panic!("unknown toggle {other}"),
        }
    }
    toggles
}

fn flat_frame(ts: f64, level: u8, w: u32, h: u32) -> Frame {
    Frame::new(ts, w, h, vec![level; (w * h * 3) as usize]).unwrap()
}

/// Smooth texture shifted horizontally by `shift` pixels.
fn textured_frame(ts: f64, shift: f64, w: u32, h: u32) -> Frame {
    let mut rgb = Vec::with_capacity((w * h * 3) as usize);
    for y in 0..h {
        for x in 0..w {
            let fx = x as f64 - shift;
            let val = 128.0
                + 50.0 * (fx * 0.18).sin()
                + 30.0 * (y as f64 * 0.25).cos()
                + 15.0 * ((fx * 0.07) + y as f64 * 0.11).sin();
            let p = val.clamp(0.0, 255.0) as u8;
            rgb.extend_from_slice(&[p, p, p]);
        }
    }
    Frame::new(ts, w, h, rgb).unwrap()
}

/// 100x100 frame matching the glare signature: 45% dark, 5% blown out,
/// 50% mid-tone.
fn glare_frame(ts: f64) -> Frame {
    let total = 100 * 100;
    let mut gray = Vec::with_capacity(total);
    gray.extend(std::iter::repeat(12u8).take(total * 45 / 100));
    gray.extend(std::iter::repeat(255u8).take(total * 5 / 100));
    gray.extend(std::iter::repeat(128u8).take(total - total * 45 / 100 - total * 5 / 100));
    let rgb: Vec<u8> = gray.iter().flat_map(|&p| [p, p, p]).collect();
    Frame::new(ts, 100, 100, rgb).unwrap()
}

fn opened_incidents(events: &[SinkEvent]) -> Vec<sentinel_kernel::Incident> {
    events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Incident(sentinel_kernel::IncidentTransition::Opened(incident)) => {
                Some(incident.clone())
            }
            _ => None,
        })
        .collect()
}

#[test]
fn blurry_lens_opens_incident_after_two_seconds() -> Result<()> {
    let mut cfg = config();
    cfg.toggles = only(&["blur"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    for i in 0..70 {
        pipeline.process_frame(flat_frame(T0 + i as f64 / FPS, 128, 64, 64))?;
    }

    let events = handle.drain_events();
    let opened = opened_incidents(&events);
    assert_eq!(opened.len(), 1, "exactly one blur incident");
    assert_eq!(opened[0].kind, IncidentKind::Blur);
    // Sustain window: the incident dates from the start of the trip, and
    // could not have opened before two seconds of footage existed.
    assert!((opened[0].first_seen_ts - T0).abs() < 0.1);
    Ok(())
}

#[test]
fn fast_pan_opens_reposition_incident() -> Result<()> {
    let mut cfg = config();
    // Scaled-down thresholds so an 8 px/frame pan exercises the fast path
    // on small test frames.
    cfg.thresholds.reposition = 3.0;
    cfg.thresholds.fast_reposition = 6.0;
    cfg.toggles = only(&["reposition"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    for i in 0..45 {
        let shift = 8.0 * i as f64;
        pipeline.process_frame(textured_frame(T0 + i as f64 / FPS, shift, 128, 96))?;
    }

    let events = handle.drain_events();
    let opened = opened_incidents(&events);
    let reposition = opened
        .iter()
        .find(|i| i.kind == IncidentKind::Reposition)
        .expect("reposition incident");
    assert_eq!(reposition.subtype, "fast");
    Ok(())
}

#[test]
fn slow_pan_trips_without_fast_path() -> Result<()> {
    let mut cfg = config();
    // A 7 px/frame pan clears the lowered slow threshold and the fixed
    // direction floor, but never the fast path.
    cfg.thresholds.reposition = 3.0;
    cfg.thresholds.fast_reposition = 100.0;
    cfg.toggles = only(&["reposition"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    for i in 0..75 {
        let shift = 7.0 * i as f64;
        pipeline.process_frame(textured_frame(T0 + i as f64 / FPS, shift, 128, 96))?;
    }

    let events = handle.drain_events();
    let opened = opened_incidents(&events);
    let reposition = opened
        .iter()
        .find(|i| i.kind == IncidentKind::Reposition)
        .expect("reposition incident");
    assert_eq!(reposition.subtype, "slow");
    Ok(())
}

#[test]
fn frozen_feed_opens_incident_after_activation() -> Result<()> {
    let mut cfg = config();
    cfg.toggles = only(&["liveness"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    // 13 seconds of an identical frame: 10 s activation gate, then the
    // 2 s sustain window.
    for i in 0..390 {
        pipeline.process_frame(textured_frame(T0 + i as f64 / FPS, 0.0, 64, 64))?;
    }

    let events = handle.drain_events();
    let opened = opened_incidents(&events);
    let frozen = opened
        .iter()
        .find(|i| i.kind == IncidentKind::Frozen)
        .expect("frozen incident");
    assert!(
        frozen.first_seen_ts >= T0 + 10.0,
        "frozen trips only after the activation window"
    );
    Ok(())
}

#[test]
fn blackout_opens_incident() -> Result<()> {
    let mut cfg = config();
    cfg.toggles = only(&["liveness"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    for i in 0..390 {
        pipeline.process_frame(flat_frame(T0 + i as f64 / FPS, 4, 64, 64))?;
    }

    let events = handle.drain_events();
    let opened = opened_incidents(&events);
    assert!(
        opened.iter().any(|i| i.kind == IncidentKind::Blackout),
        "brightness 4 must raise a blackout incident"
    );
    Ok(())
}

#[test]
fn glare_rescue_preserves_shape_and_flattens_blowout() -> Result<()> {
    let mut cfg = config();
    cfg.toggles = only(&["glare", "glare_rescue"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    pipeline.process_frame(glare_frame(T0))?;

    let processed = handle.latest_processed().expect("processed frame");
    assert_eq!((processed.width, processed.height), (100, 100));
    assert_eq!(processed.rgb.len(), 100 * 100 * 3);

    // A blown-out source pixel away from the watermark region must be
    // flattened to neutral gray. Pixel 4600 sits at (x=0, y=46); the
    // watermark square covers x,y in [50, 90).
    let raw = handle.latest_raw().expect("raw frame");
    assert!(raw.rgb[4600 * 3] > 252, "chosen pixel is blown out in the source");
    assert_eq!(&processed.rgb[4600 * 3..4600 * 3 + 3], &[150, 150, 150]);
    Ok(())
}

#[test]
fn glare_incident_persists_snapshot_row() -> Result<()> {
    let snapshot_dir = tempfile::tempdir()?;
    let db_dir = tempfile::tempdir()?;
    let db_path = db_dir.path().join("sentinel.db");

    let mut cfg = config();
    cfg.toggles = only(&["glare", "glare_rescue"]);
    cfg.snapshot_dir = snapshot_dir.path().to_path_buf();
    let store = IncidentStore::open(&db_path.to_string_lossy())?;
    let mut pipeline = Pipeline::new(&cfg, Some(store))?;

    for i in 0..70 {
        pipeline.process_frame(glare_frame(T0 + i as f64 / FPS))?;
    }

    let store = IncidentStore::open(&db_path.to_string_lossy())?;
    let incidents = store.recent_incidents(10)?;
    assert!(incidents.iter().any(|i| i.kind == "glare"));

    let snapshots: Vec<_> = std::fs::read_dir(snapshot_dir.path())?
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(snapshots.len(), 1, "one snapshot per opened glare incident");
    Ok(())
}

#[test]
fn dismissing_reposition_clears_the_incident() -> Result<()> {
    let mut cfg = config();
    cfg.thresholds.reposition = 3.0;
    cfg.thresholds.fast_reposition = 6.0;
    cfg.toggles = only(&["reposition"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    for i in 0..45 {
        let shift = 8.0 * i as f64;
        pipeline.process_frame(textured_frame(T0 + i as f64 / FPS, shift, 128, 96))?;
    }
    assert!(!opened_incidents(&handle.drain_events()).is_empty());

    handle.dismiss_reposition_alert();
    pipeline.process_frame(textured_frame(T0 + 2.0, 0.0, 128, 96))?;

    let events = handle.drain_events();
    let closed = events.iter().any(|e| match e {
        SinkEvent::Incident(sentinel_kernel::IncidentTransition::Closed(incident)) => {
            incident.kind == IncidentKind::Reposition
        }
        _ => false,
    });
    assert!(closed, "dismissal must close the open reposition incident");
    Ok(())
}

#[test]
fn pipeline_output_validates_live_and_rejects_replay() -> Result<()> {
    let mut cfg = config();
    cfg.toggles = only(&[]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    // Record 3 seconds of watermarked output losslessly.
    let mut recording = Vec::new();
    for i in 0..90 {
        let ts = T0 + i as f64 / FPS;
        pipeline.process_frame(flat_frame(ts, 60, 128, 96))?;
        let published = handle.latest_processed().expect("processed frame");
        recording.push(Frame::new(
            published.timestamp_s,
            published.width,
            published.height,
            published.rgb.as_ref().clone(),
        )?);
    }

    let key = WatermarkKey::new(SECRET)?;
    let live = validate_frames(
        &key,
        &recording,
        ValidatorClock::Embedded,
        ValidationTolerances::default(),
    );
    assert_eq!(live.status, ValidationStatus::Live);
    assert_eq!(live.match_rate, 1.0);

    // One hour later the same file is replayed against "now".
    let replayed = validate_frames(
        &key,
        &recording,
        ValidatorClock::FixedStart(T0 + 3600.0),
        ValidationTolerances::default(),
    );
    assert_eq!(replayed.status, ValidationStatus::NotLive);
    Ok(())
}

#[test]
fn events_preserve_frame_order() -> Result<()> {
    let mut cfg = config();
    cfg.toggles = only(&["blur"]);
    let mut pipeline = Pipeline::new(&cfg, None)?;
    let handle = pipeline.handle();

    for i in 0..20 {
        pipeline.process_frame(flat_frame(T0 + i as f64 / FPS, 128, 64, 64))?;
    }

    let mut last_ts = f64::MIN;
    for event in handle.drain_events() {
        if let SinkEvent::Detections(record) = event {
            assert!(record.timestamp_s > last_ts, "detection records out of order");
            last_ts = record.timestamp_s;
        }
    }
    Ok(())
}
