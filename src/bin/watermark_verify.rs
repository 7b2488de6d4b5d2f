//! watermark_verify - offline validator for the time-keyed frame watermark.
//!
//! Given a recorded frame sequence and the shared secret, recomputes the
//! expected per-second color token for every frame, measures the observed
//! color in the watermark region, and reports LIVE or NOT_LIVE with a
//! per-frame audit trail. A replayed recording fails whenever the checking
//! clock disagrees with the recording's own timeline.

use std::path::Path;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use sentinel_kernel::{
    validate_recording, IncidentStore, ValidationStatus, ValidationTolerances, ValidatorClock,
    WatermarkKey,
};

#[derive(Parser, Debug)]
#[command(
    name = "watermark_verify",
    about = "Validate the time-keyed watermark of a recorded frame sequence"
)]
struct Args {
    /// Directory of recorded frames (checked in file-name order)
    #[arg(long, value_name = "PATH")]
    frames: String,

    /// Unix second the recording started at
    #[arg(long, value_name = "UNIX_SECONDS")]
    start: f64,

    /// Frame rate of the recording
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Watermark secret (falls back to SENTINEL_WATERMARK_KEY)
    #[arg(long, conflicts_with = "secret_file")]
    secret: Option<String>,

    /// Path to a file containing the watermark secret
    #[arg(long, value_name = "PATH", conflicts_with = "secret")]
    secret_file: Option<String>,

    /// Check against this clock instead of the recording's own timeline
    /// ("now" accepted)
    #[arg(long, value_name = "UNIX_SECONDS")]
    clock: Option<String>,

    /// Record the verdict into this sentinel database
    #[arg(long, value_name = "PATH")]
    db: Option<String>,

    /// Emit the full JSON report on stdout
    #[arg(long)]
    json: bool,

    /// Print every frame check, not just mismatches
    #[arg(short, long)]
    verbose: bool,
}

fn load_secret(args: &Args) -> Result<String, String> {
    if let Some(secret) = &args.secret {
        return Ok(secret.clone());
    }
    if let Some(path) = &args.secret_file {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| format!("failed to read secret file {path}: {e}"));
    }
    std::env::var("SENTINEL_WATERMARK_KEY")
        .map_err(|_| "no secret given (use --secret, --secret-file, or SENTINEL_WATERMARK_KEY)".to_string())
}

fn parse_clock(arg: Option<&str>) -> Result<ValidatorClock, String> {
    match arg {
        None => Ok(ValidatorClock::Embedded),
        Some("now") => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| ValidatorClock::FixedStart(d.as_secs_f64()))
            .map_err(|e| format!("system clock before epoch: {e}")),
        Some(raw) => raw
            .parse::<f64>()
            .map(ValidatorClock::FixedStart)
            .map_err(|_| format!("--clock must be a unix second or 'now', got '{raw}'")),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let secret = match load_secret(&args) {
        Ok(secret) => secret,
        Err(e) => {
            eprintln!("watermark_verify: {e}");
            return ExitCode::from(2);
        }
    };
    let key = match WatermarkKey::new(&secret) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("watermark_verify: {e}");
            return ExitCode::from(2);
        }
    };
    let clock = match parse_clock(args.clock.as_deref()) {
        Ok(clock) => clock,
        Err(e) => {
            eprintln!("watermark_verify: {e}");
            return ExitCode::from(2);
        }
    };

    let report = validate_recording(
        &key,
        Path::new(&args.frames),
        args.start,
        args.fps,
        clock,
        ValidationTolerances::default(),
    );

    if let Some(db_path) = &args.db {
        match IncidentStore::open(db_path) {
            Ok(mut store) => {
                let frame_results =
                    serde_json::to_string(&report.frames).unwrap_or_else(|_| "[]".to_string());
                if let Err(e) = store.record_validation(
                    None,
                    &args.frames,
                    report.status.as_str(),
                    &frame_results,
                    args.start,
                ) {
                    log::warn!("validation row write failed: {e}");
                }
            }
            Err(e) => log::warn!("validation store unavailable: {e}"),
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("watermark_verify: report serialization failed: {e}");
                return ExitCode::from(3);
            }
        }
        return ExitCode::SUCCESS;
    }

    match report.status {
        ValidationStatus::Error => {
            println!(
                "status: ERROR ({})",
                report.error.as_deref().unwrap_or("unknown")
            );
        }
        status => {
            println!("status: {}", status.as_str());
            println!(
                "match rate: {:.1}% over {} frames",
                report.match_rate * 100.0,
                report.frames.len()
            );
            for check in &report.frames {
                if !check.matched || args.verbose {
                    let dist = check
                        .distance
                        .map(|d| format!("{d:.1}"))
                        .unwrap_or_else(|| "n/a".to_string());
                    println!(
                        "  frame {:>5} second {} expected {:?} distance {} {}",
                        check.index,
                        check.checked_second,
                        check.expected,
                        dist,
                        if check.matched { "ok" } else { "MISMATCH" }
                    );
                }
            }
        }
    }

    ExitCode::SUCCESS
}
