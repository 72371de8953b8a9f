use log::{info, warn};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

/// Tracks when a sensor last delivered data
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub name: String,
    pub silence_threshold: Duration,
    last_update: Arc<Mutex<Instant>>,
    // true while the current silence has already been reported
    reported: Arc<Mutex<bool>>,
    silence_periods: Arc<Mutex<u32>>,
}

impl SensorHealth {
    pub fn new(name: &str, silence_threshold_secs: u64) -> Self {
        SensorHealth {
            name: name.to_string(),
            silence_threshold: Duration::from_secs(silence_threshold_secs),
            last_update: Arc::new(Mutex::new(Instant::now())),
            reported: Arc::new(Mutex::new(false)),
            silence_periods: Arc::new(Mutex::new(0)),
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    /// Number of distinct silence periods seen so far
    pub fn silence_periods(&self) -> u32 {
        self.silence_periods.lock().map(|n| *n).unwrap_or(0)
    }

    /// Compare against the last check. Each silence period is reported once,
    /// and the first check after data resumes reports the recovery.
    pub fn check(&self) -> HealthTransition {
        let silent = self.is_silent();
        let Ok(mut reported) = self.reported.lock() else {
            return HealthTransition::Unchanged;
        };
        match (silent, *reported) {
            (true, false) => {
                *reported = true;
                if let Ok(mut n) = self.silence_periods.lock() {
                    *n += 1;
                }
                HealthTransition::WentSilent(self.time_since_last_update().unwrap_or_default())
            }
            (false, true) => {
                *reported = false;
                HealthTransition::Recovered
            }
            _ => HealthTransition::Unchanged,
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            healthy: !self.is_silent(),
            silence_secs: self
                .time_since_last_update()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            silence_periods: self.silence_periods(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HealthTransition {
    Unchanged,
    WentSilent(Duration),
    Recovered,
}

/// Report of sensor health status
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub silence_secs: f64,
    pub silence_periods: u32,
}

/// Periodically check `health`, warning once per silence period
pub fn spawn_watchdog(health: SensorHealth, check_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(check_interval).await;
            match health.check() {
                HealthTransition::WentSilent(d) => warn!(
                    "[health] {} silent for {:.1}s, detection is paused",
                    health.name,
                    d.as_secs_f64()
                ),
                HealthTransition::Recovered => info!("[health] {} data resumed", health.name),
                HealthTransition::Unchanged => {}
            }
        }
    })
}
