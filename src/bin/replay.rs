use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;

use crash_alert_rs::detection::{AccidentDetector, DetectorStats};
use crash_alert_rs::sensors::load_recording;
use crash_alert_rs::types::AccidentType;
use crash_alert_rs::EngineConfig;

#[derive(Parser, Debug)]
#[command(about = "Replay recorded sensor sessions through the detection pipeline")]
struct Args {
    /// Path to a recorded session (.json or .json.gz)
    #[arg(long, conflicts_with = "dir", required_unless_present = "dir")]
    log: Option<PathBuf>,

    /// Directory of recorded sessions to batch replay
    #[arg(long)]
    dir: Option<PathBuf>,

    /// JSON configuration file (only the detection section is used)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds after a detection during which further detections are
    /// suppressed, standing in for the alert countdown
    #[arg(long, default_value = "15.0")]
    cooldown: f64,
}

#[derive(Serialize)]
struct ReplayEvent {
    sample_time: f64,
    kind: AccidentType,
    confidence: f64,
    acceleration_magnitude: f64,
    gyroscope_magnitude: f64,
}

#[derive(Serialize)]
struct ReplaySummary {
    file: String,
    samples: usize,
    duration_secs: f64,
    stats: DetectorStats,
    suppressed: u64,
    events: Vec<ReplayEvent>,
}

async fn run_once(path: &Path, config: &EngineConfig, cooldown: f64) -> Result<ReplaySummary> {
    let samples =
        load_recording(path).with_context(|| format!("reading {}", path.display()))?;
    let mut detector =
        AccidentDetector::new(config.detection.clone(), config.arbitration.clone())?;

    let mut events: Vec<ReplayEvent> = Vec::new();
    let mut suppressed = 0u64;
    for sample in &samples {
        let Some(detection) = detector.process(sample).await else {
            continue;
        };
        if let Some(last) = events.last() {
            if sample.timestamp - last.sample_time < cooldown {
                suppressed += 1;
                continue;
            }
        }
        let e = detection.event;
        events.push(ReplayEvent {
            sample_time: sample.timestamp,
            kind: e.kind,
            confidence: e.confidence,
            acceleration_magnitude: e.acceleration_magnitude,
            gyroscope_magnitude: e.gyroscope_magnitude,
        });
        detector.reset();
    }

    let duration_secs = match (samples.first(), samples.last()) {
        (Some(a), Some(b)) => b.timestamp - a.timestamp,
        _ => 0.0,
    };
    Ok(ReplaySummary {
        file: path.display().to_string(),
        samples: samples.len(),
        duration_secs,
        stats: detector.stats(),
        suppressed,
        events,
    })
}

fn session_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.ends_with(".json") || name.ends_with(".json.gz")
        })
        .collect();
    files.sort();
    Ok(files)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // remote arbitration stays off: replays must be reproducible offline
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let files = match (&args.log, &args.dir) {
        (Some(log), _) => vec![log.clone()],
        (None, Some(dir)) => session_files(dir)?,
        (None, None) => Vec::new(),
    };

    let mut summaries = Vec::new();
    for file in &files {
        match run_once(file, &config, args.cooldown).await {
            Ok(summary) => summaries.push(summary),
            Err(e) => eprintln!("[replay] Skipping {}: {:#}", file.display(), e),
        }
    }

    let total_events: usize = summaries.iter().map(|s| s.events.len()).sum();
    let output = if args.log.is_some() && summaries.len() == 1 {
        serde_json::to_value(&summaries[0])?
    } else {
        json!({
            "sessions": summaries,
            "total_sessions": files.len(),
            "total_events": total_events,
        })
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
