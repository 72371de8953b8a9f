//! Engine configuration.
//!
//! Every section has sensible defaults and can be loaded from a JSON file.
//! Missing fields fall back to their defaults, so a config file only needs
//! to list what it overrides. Durations are written as seconds (f64).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::types::ProfileSnapshot;

// ─── Detection ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    // ── Rule thresholds ──
    pub acceleration_threshold: f64, // m/s²
    pub gyroscope_threshold: f64,    // rad/s
    pub sudden_stop_threshold: f64,  // m/s² per-sample delta on the travel axis
    pub fall_threshold: f64,         // m/s²
    pub minimum_confidence: f64,

    // ── Calibration / filtering ──
    pub calibration_samples: usize,
    pub noise_threshold: f64,
    pub gravity_alpha: f64,

    // ── Windowing ──
    pub window_size: usize,
    pub buffer_capacity: usize,
    pub analysis_stride: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            acceleration_threshold: 15.0,
            gyroscope_threshold: 6.0,
            sudden_stop_threshold: 8.0,
            fall_threshold: 3.0,
            minimum_confidence: 0.65,

            calibration_samples: 50,
            noise_threshold: 0.5,
            gravity_alpha: 0.9,

            window_size: 10,
            buffer_capacity: 300,
            analysis_stride: 3,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.minimum_confidence) {
            return Err(EngineError::Config(format!(
                "minimum_confidence {} outside [0, 1]",
                self.minimum_confidence
            )));
        }
        if self.window_size == 0 || self.buffer_capacity < self.window_size {
            return Err(EngineError::Config(format!(
                "buffer_capacity ({}) must hold at least one window ({})",
                self.buffer_capacity, self.window_size
            )));
        }
        if self.analysis_stride == 0 || self.calibration_samples == 0 {
            return Err(EngineError::Config(
                "analysis_stride and calibration_samples must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.gravity_alpha) {
            return Err(EngineError::Config(format!(
                "gravity_alpha {} outside [0, 1)",
                self.gravity_alpha
            )));
        }
        Ok(())
    }
}

// ─── Remote arbitration ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub enabled: bool,
    pub band_min: f64,
    pub band_max: f64,
    #[serde(with = "duration_secs")]
    pub query_throttle: Duration,
    #[serde(with = "duration_secs")]
    pub episode_cooldown: Duration,
    pub min_pattern_matches: u32,
    pub agree_bonus: f64,
    pub disagree_penalty: f64,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            band_min: 0.45,
            band_max: 0.70,
            query_throttle: Duration::from_secs(10),
            episode_cooldown: Duration::from_secs(15),
            min_pattern_matches: 2,
            agree_bonus: 0.20,
            disagree_penalty: 0.10,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ArbitrationConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.band_min)
            || !unit.contains(&self.band_max)
            || self.band_min > self.band_max
        {
            return Err(EngineError::Config(format!(
                "arbitration band [{}, {}] must lie within [0, 1]",
                self.band_min, self.band_max
            )));
        }
        if !unit.contains(&self.agree_bonus) || !unit.contains(&self.disagree_penalty) {
            return Err(EngineError::Config(
                "agree_bonus and disagree_penalty must lie within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Alert timing ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    #[serde(with = "duration_secs")]
    pub dispose_grace: Duration,
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub inter_call_delay: Duration,
    #[serde(with = "duration_secs")]
    pub failed_call_delay: Duration,
    #[serde(with = "duration_secs")]
    pub sms_gap: Duration,

    // ── Emergency location policy ──
    #[serde(with = "duration_secs")]
    pub location_max_age: Duration,
    pub location_max_accuracy_m: f64,
    #[serde(with = "duration_secs")]
    pub fresh_fix_timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dispose_grace: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            inter_call_delay: Duration::from_secs(3),
            failed_call_delay: Duration::from_secs(2),
            sms_gap: Duration::from_millis(500),

            location_max_age: Duration::from_secs(30),
            location_max_accuracy_m: 50.0,
            fresh_fix_timeout: Duration::from_secs(15),
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.call_timeout.is_zero() {
            return Err(EngineError::Config("call_timeout must be > 0".to_string()));
        }
        if !self.location_max_accuracy_m.is_finite() || self.location_max_accuracy_m < 0.0 {
            return Err(EngineError::Config(format!(
                "location_max_accuracy_m {} must be a non-negative distance",
                self.location_max_accuracy_m
            )));
        }
        Ok(())
    }
}

// ─── Remote API ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub device_id: String,
    pub user_id: Option<String>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    // ── Retry / pending queue ──
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,
    #[serde(with = "duration_secs")]
    pub health_retry_interval: Duration,
    #[serde(with = "duration_secs")]
    pub drain_gap: Duration,
    pub pending_path: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/".to_string(),
            api_key: String::new(),
            device_id: "unknown_device".to_string(),
            user_id: None,
            request_timeout: Duration::from_secs(30),

            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            health_retry_interval: Duration::from_secs(10),
            drain_gap: Duration::from_secs(1),
            pending_path: PathBuf::from("crash_alert_pending.json"),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be >= 1".to_string()));
        }
        if self.health_interval.is_zero() || self.health_retry_interval.is_zero() {
            return Err(EngineError::Config(
                "health_interval and health_retry_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Monitoring service ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub channel_capacity: usize,
    pub status_path: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub status_interval: Duration,
    pub accel_silence_secs: u64,

    // ── Sensor-event telemetry ──
    pub telemetry_enabled: bool,
    #[serde(with = "duration_secs")]
    pub telemetry_interval: Duration,
    #[serde(with = "duration_secs")]
    pub telemetry_window: Duration,
    pub upload_labelled_samples: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 20, // ~50Hz
            channel_capacity: 256,
            status_path: None,
            status_interval: Duration::from_secs(1),
            accel_silence_secs: 5,

            telemetry_enabled: false,
            telemetry_interval: Duration::from_secs(2),
            telemetry_window: Duration::from_secs(2),
            upload_labelled_samples: false,
        }
    }
}

impl MonitorConfig {
    /// Zero periods and capacities would panic in tokio's `interval` and `channel`.
    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_interval_ms == 0 {
            return Err(EngineError::Config("sample_interval_ms must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(EngineError::Config("channel_capacity must be > 0".to_string()));
        }
        if self.status_interval.is_zero() {
            return Err(EngineError::Config("status_interval must be > 0".to_string()));
        }
        if self.telemetry_enabled && self.telemetry_interval.is_zero() {
            return Err(EngineError::Config(
                "telemetry_interval must be > 0 when telemetry is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detection: DetectionConfig,
    pub arbitration: ArbitrationConfig,
    pub alert: AlertConfig,
    pub api: ApiConfig,
    pub monitor: MonitorConfig,
    /// Initial profile for the in-process profile store (contacts, medical info, settings)
    pub profile: ProfileSnapshot,
}

impl EngineConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.detection.validate()?;
        self.arbitration.validate()?;
        self.alert.validate()?;
        self.api.validate()?;
        self.monitor.validate()
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Serialize `Duration` as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid duration: {} seconds",
                secs
            )));
        }
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!("invalid duration: {} seconds", secs))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.calibration_samples, 50);
        assert_eq!(config.arbitration.query_throttle, Duration::from_secs(10));
        assert_eq!(config.alert.sms_gap, Duration::from_millis(500));
        assert_eq!(config.api.max_attempts, 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{
            "detection": { "acceleration_threshold": 18.0 },
            "api": { "base_url": "https://alerts.example.org/", "retry_delay": 0.25 }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.detection.acceleration_threshold, 18.0);
        assert_eq!(config.detection.fall_threshold, 3.0);
        assert_eq!(config.api.retry_delay, Duration::from_millis(250));
        assert_eq!(config.api.max_attempts, 3);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let json = r#"{ "alert": { "call_timeout": -1.0 } }"#;
        assert!(serde_json::from_str::<EngineConfig>(json).is_err());
    }

    #[test]
    fn test_huge_duration_rejected() {
        let json = r#"{ "api": { "retry_delay": 1e300 } }"#;
        assert!(serde_json::from_str::<EngineConfig>(json).is_err());
    }

    #[test]
    fn test_zero_sample_interval_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "monitor": { "sample_interval_ms": 0 } }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_section_validation() {
        let mut config = EngineConfig::default();
        config.monitor.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.monitor.status_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.monitor.telemetry_interval = Duration::ZERO;
        assert!(config.validate().is_ok());
        config.monitor.telemetry_enabled = true;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.alert.call_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.api.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.arbitration.band_min = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let config = DetectionConfig {
            window_size: 20,
            buffer_capacity: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut config = EngineConfig::default();
        config.api.device_id = "device-42".to_string();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
