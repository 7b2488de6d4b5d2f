//! sentineld - tamper-resistant surveillance pipeline daemon
//!
//! This daemon:
//! 1. Ingests frames from the configured capture source
//! 2. Runs the detector bank (blur, glare, liveness, shake, reposition)
//! 3. Aggregates signals into persistent incidents
//! 4. Applies enabled enhancement filters and the per-second watermark
//! 5. Publishes frames and structured events; persists incidents
//!
//! Exit codes: 0 normal, 1 capture device unavailable, 2 configuration
//! error, 3 unrecoverable pipeline error.

use std::process::ExitCode;
use std::time::Duration;

use sentinel_kernel::{open_source, ExitStatus, KernelConfig, Pipeline, SinkEvent};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match KernelConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    // Persistence is best-effort: a broken store degrades to in-memory
    // operation instead of blocking surveillance.
    let store = match sentinel_kernel::IncidentStore::open(&cfg.db_path) {
        Ok(store) => Some(store),
        Err(e) => {
            log::warn!("incident store unavailable ({e}); running without persistence");
            None
        }
    };

    let mut source = match open_source(&cfg.capture) {
        Ok(source) => source,
        Err(e) => {
            log::error!("capture source error: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = source.connect() {
        log::error!("capture device unavailable: {e}");
        return ExitCode::from(1);
    }

    let mut pipeline = match Pipeline::new(&cfg, store) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::error!("pipeline init failed: {e}");
            return ExitCode::from(3);
        }
    };
    let handle = pipeline.handle();

    log::info!("sentineld running. source={}, db={}", cfg.capture.source, cfg.db_path);
    log::info!(
        "thresholds: blur={}, shake={}, reposition={}/{}, liveness={}",
        cfg.thresholds.blur,
        cfg.thresholds.shake,
        cfg.thresholds.reposition,
        cfg.thresholds.fast_reposition,
        cfg.thresholds.liveness,
    );

    // Event consumer standing in for the transport layer: incidents go to
    // the log, detection records are drained silently.
    let consumer_handle = handle.clone();
    std::thread::spawn(move || loop {
        match consumer_handle.next_event() {
            Some(SinkEvent::Incident(transition)) => {
                let incident = transition.incident();
                log::info!(
                    "incident #{} {} count={} :: {}",
                    incident.id,
                    incident.kind.as_str(),
                    incident.count,
                    incident.description
                );
            }
            Some(SinkEvent::Detections(_)) => {}
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    });

    match pipeline.run(&mut *source) {
        Ok(ExitStatus::Completed) => {
            log::info!(
                "pipeline finished after {} frames ({} events dropped)",
                pipeline.frames_processed(),
                handle.dropped_events()
            );
            ExitCode::SUCCESS
        }
        Ok(ExitStatus::CaptureLost) => {
            log::error!("capture lost; exiting");
            ExitCode::from(1)
        }
        Err(e) => {
            log::error!("pipeline error: {e}");
            ExitCode::from(3)
        }
    }
}
