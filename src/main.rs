use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crash_alert_rs::alert::AlertDeps;
use crash_alert_rs::api::{AlertApi, ApiClient, SubmissionService};
use crash_alert_rs::detection::{ApiRemoteClassifier, RemoteClassifier};
use crash_alert_rs::platform::simulated::{
    InMemoryProfileStore, LogMessaging, LogNotifications, LogTelephony, LogWakeLock,
    StaticLocation,
};
use crash_alert_rs::sensors::{MockSource, SampleSource, TermuxSource};
use crash_alert_rs::{EngineConfig, MonitoringService};

#[derive(Parser, Debug)]
#[command(name = "crash_alert")]
#[command(about = "Accident detection and emergency alert engine", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base URL of the alert backend
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token for the alert backend
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    device_id: Option<String>,

    /// Run without the alert backend (no remote arbitration or reporting)
    #[arg(long)]
    offline: bool,

    /// Use the synthetic sensor source instead of termux-sensor
    #[arg(long)]
    mock: bool,

    /// With --mock, inject a collision at this sample index
    #[arg(long, value_name = "SAMPLE", requires = "mock")]
    collision_at: Option<u64>,

    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Never place voice calls, whatever the profile says
    #[arg(long)]
    no_calls: bool,

    /// Write the engine status here every status interval
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Fixed position reported with alerts, as LAT,LON
    #[arg(long, value_parser = parse_position)]
    position: Option<(f64, f64)>,
}

fn parse_position(s: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| "expected LAT,LON".to_string())?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("latitude: {}", e))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("longitude: {}", e))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err("position out of range".to_string());
    }
    Ok((lat, lon))
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(url) = &args.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(key) = &args.api_key {
        config.api.api_key = key.clone();
    }
    if let Some(id) = &args.device_id {
        config.api.device_id = id.clone();
    }
    if let Some(path) = &args.status_file {
        config.monitor.status_path = Some(path.clone());
    }
    if args.no_calls {
        config.profile.settings.make_call = false;
    }
    Ok(config)
}

async fn pick_source(args: &Args, interval: Duration) -> Arc<dyn SampleSource> {
    if !args.mock {
        let termux = TermuxSource::new(interval);
        if termux.has_accelerometer().await {
            return Arc::new(termux);
        }
        warn!("[main] termux-sensor unavailable, falling back to mock data");
    }
    let mut mock = MockSource::new(interval);
    if let Some(n) = args.collision_at {
        mock = mock.with_collision_at(n);
    }
    Arc::new(mock)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;

    info!("[main] Crash alert engine starting");
    info!("  Device: {}", config.api.device_id);
    info!(
        "  Backend: {}",
        if args.offline { "offline" } else { config.api.base_url.as_str() }
    );
    info!("  Contacts: {}", config.profile.active_contacts().len());
    info!("  Duration: {} seconds (0=continuous)", args.duration);

    let (submission, remote) = if args.offline {
        (None, None)
    } else {
        let api: Arc<dyn AlertApi> = Arc::new(ApiClient::new(&config.api));
        let submission = SubmissionService::new(Arc::clone(&api), config.api.clone())
            .context("opening pending submission queue")?;
        if submission.pending_len() > 0 {
            info!("[main] {} submission(s) pending from a previous run", submission.pending_len());
        }
        let remote: Arc<dyn RemoteClassifier> = Arc::new(ApiRemoteClassifier::new(api));
        (Some(Arc::new(submission)), Some(remote))
    };

    let location = match args.position {
        Some((lat, lon)) => StaticLocation::new(lat, lon, 10.0),
        None => StaticLocation::unavailable(),
    };
    let deps = AlertDeps {
        location: Arc::new(location),
        messaging: Arc::new(LogMessaging),
        telephony: Arc::new(LogTelephony::new(Duration::from_secs(10))),
        notifications: Arc::new(LogNotifications),
        profile: Arc::new(InMemoryProfileStore::new(config.profile.clone())),
        submission,
    };

    let source = pick_source(&args, Duration::from_millis(config.monitor.sample_interval_ms)).await;
    let service = MonitoringService::new(config, source, Arc::new(LogWakeLock), deps, remote)
        .context("building monitoring service")?;
    service.start().await.context("starting monitoring")?;

    let run_for = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
            info!("[main] Duration reached, stopping...");
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = run_for => {}
        r = tokio::signal::ctrl_c() => {
            r.context("waiting for Ctrl-C")?;
            info!("[main] Interrupted, stopping...");
        }
    }

    let status = service.status().await;
    service.stop().await.context("stopping monitoring")?;

    println!("\n=== Final Stats ===");
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
