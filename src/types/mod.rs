pub mod profile;

pub use profile::*;

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// One fused accelerometer + gyroscope reading (m/s², rad/s).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl SensorSample {
    pub fn new(timestamp: f64, accel: [f64; 3], gyro: [f64; 3]) -> Self {
        Self {
            timestamp,
            accel: Vector3::from(accel),
            gyro: Vector3::from(gyro),
        }
    }

    pub fn accel_magnitude(&self) -> f64 {
        self.accel.norm()
    }

    pub fn gyro_magnitude(&self) -> f64 {
        self.gyro.norm()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub time: DateTime<Utc>,
}

impl LocationFix {
    /// "Lat: 19.432608, Lng: -99.133209, Accuracy: 12.0m"
    pub fn format(&self) -> String {
        format!(
            "Lat: {:.6}, Lng: {:.6}, Accuracy: {:.1}m",
            self.latitude, self.longitude, self.accuracy
        )
    }

    pub fn maps_link(&self) -> String {
        format!(
            "https://maps.google.com/?q={},{}",
            self.latitude, self.longitude
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccidentType {
    Collision,
    SuddenStop,
    Rollover,
    Fall,
    Unknown,
}

impl AccidentType {
    /// Candidate order for rule priority and ensemble tie-breaks.
    pub const CANDIDATES: [AccidentType; 4] = [
        AccidentType::Collision,
        AccidentType::Rollover,
        AccidentType::SuddenStop,
        AccidentType::Fall,
    ];

    /// Lowercase wire name (`accident_type` field)
    pub fn wire_name(&self) -> &'static str {
        match self {
            AccidentType::Collision => "collision",
            AccidentType::SuddenStop => "sudden_stop",
            AccidentType::Rollover => "rollover",
            AccidentType::Fall => "fall",
            AccidentType::Unknown => "unknown",
        }
    }

    /// Uppercase name used for `predicted_label` and training labels
    pub fn upper_name(&self) -> &'static str {
        match self {
            AccidentType::Collision => "COLLISION",
            AccidentType::SuddenStop => "SUDDEN_STOP",
            AccidentType::Rollover => "ROLLOVER",
            AccidentType::Fall => "FALL",
            AccidentType::Unknown => "UNKNOWN",
        }
    }

    /// Human readable text for messages and notifications
    pub fn display_text(&self) -> &'static str {
        match self {
            AccidentType::Collision => "Collision",
            AccidentType::SuddenStop => "Sudden stop",
            AccidentType::Rollover => "Rollover",
            AccidentType::Fall => "Fall",
            AccidentType::Unknown => "Unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccidentEvent {
    pub timestamp: DateTime<Utc>,
    pub acceleration_magnitude: f64,
    pub gyroscope_magnitude: f64,
    pub location: Option<LocationFix>,
    pub confidence: f64,
    #[serde(rename = "type")]
    pub kind: AccidentType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    /// Countdown running, user may cancel
    Pending,
    Cancelled,
    Confirmed,
    Sent,
    Failed,
}

impl AlertStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AlertStatus::Cancelled | AlertStatus::Sent | AlertStatus::Failed
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub id: String,
    pub accident_event: AccidentEvent,
    pub location: Option<LocationFix>,
    pub medical_info: Option<MedicalProfile>,
    pub status: AlertStatus,
    pub cancel_time_remaining: u32,
    pub contacts_notified: Vec<String>,
    pub remote_alert_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmergencyAlert {
    pub fn new(
        event: AccidentEvent,
        location: Option<LocationFix>,
        medical_info: Option<MedicalProfile>,
        countdown_secs: u32,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("alert_{}", created_at.timestamp_millis()),
            accident_event: event,
            location,
            medical_info,
            status: AlertStatus::Pending,
            cancel_time_remaining: countdown_secs,
            contacts_notified: Vec::new(),
            remote_alert_id: None,
            created_at,
        }
    }
}
