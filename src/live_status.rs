use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::api::Connectivity;
use crate::detection::DetectorStats;
use crate::health_monitor::HealthReport;
use crate::types::{AlertStatus, EmergencyAlert};

/// Point-in-time view of the engine, written as JSON for external dashboards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EngineStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub running: bool,
    // Detection
    pub samples_received: u64,
    pub samples_analyzed: u64,
    pub detections: u64,
    pub remote_queries: u64,
    pub calibration_complete: bool,
    pub calibration_progress: f64,
    // Current alert
    pub alert_id: Option<String>,
    pub alert_status: Option<AlertStatus>,
    pub countdown_remaining: Option<u32>,
    pub calls_pending: usize,
    // Remote service
    pub pending_submissions: usize,
    pub connectivity: Connectivity,
    // Accelerometer health
    pub accel_healthy: bool,
    pub accel_silence_secs: f64,
    pub accel_silence_periods: u32,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            running: false,
            samples_received: 0,
            samples_analyzed: 0,
            detections: 0,
            remote_queries: 0,
            calibration_complete: false,
            calibration_progress: 0.0,
            alert_id: None,
            alert_status: None,
            countdown_remaining: None,
            calls_pending: 0,
            pending_submissions: 0,
            connectivity: Connectivity::Unknown,
            accel_healthy: true,
            accel_silence_secs: 0.0,
            accel_silence_periods: 0,
        }
    }

    pub fn set_detector(&mut self, stats: DetectorStats, calibrated: bool, progress: (usize, usize)) {
        self.samples_received = stats.samples_received;
        self.samples_analyzed = stats.samples_analyzed;
        self.detections = stats.detections;
        self.remote_queries = stats.remote_queries;
        self.calibration_complete = calibrated;
        self.calibration_progress = if progress.1 == 0 {
            1.0
        } else {
            progress.0 as f64 / progress.1 as f64
        };
    }

    pub fn set_alert(&mut self, alert: Option<&EmergencyAlert>, calls_pending: usize) {
        self.alert_id = alert.map(|a| a.id.clone());
        self.alert_status = alert.map(|a| a.status);
        self.countdown_remaining = alert
            .filter(|a| a.status == AlertStatus::Pending)
            .map(|a| a.cancel_time_remaining);
        self.calls_pending = calls_pending;
    }

    pub fn set_health(&mut self, report: HealthReport) {
        self.accel_healthy = report.healthy;
        self.accel_silence_secs = report.silence_secs;
        self.accel_silence_periods = report.silence_periods;
    }

    /// Write pretty JSON through a temporary file so readers never see a partial document.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
