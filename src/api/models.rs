//! REST wire models for the alert backend.
//!
//! Field names follow the backend's snake_case JSON. Optional fields are
//! omitted when `None` so the payloads stay minimal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{AccidentEvent, EmergencyAlert, EmergencyContact, LocationFix, MedicalProfile};

/// ISO-8601 with milliseconds, always UTC ("2024-01-01T00:00:00.000Z")
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationData {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl From<&LocationFix> for LocationData {
    fn from(fix: &LocationFix) -> Self {
        LocationData {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: Some(fix.accuracy),
            altitude: fix.altitude,
            speed: fix.speed,
            timestamp: Some(format_timestamp(&fix.time)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicalInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blood_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allergies: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medications: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_conditions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_medical_info: Option<String>,
}

fn non_empty_list(items: &[String]) -> Option<Vec<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

fn non_blank(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl From<&MedicalProfile> for MedicalInfo {
    fn from(p: &MedicalProfile) -> Self {
        MedicalInfo {
            blood_type: Some(p.blood_type.display_name().to_string()),
            allergies: non_empty_list(&p.allergies),
            medications: non_empty_list(&p.medications),
            medical_conditions: non_empty_list(&p.medical_conditions),
            emergency_medical_info: non_blank(&p.emergency_medical_info),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    pub name: String,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
}

impl From<&EmergencyContact> for ContactData {
    fn from(c: &EmergencyContact) -> Self {
        ContactData {
            name: c.name.clone(),
            phone: c.phone.clone(),
            relationship: non_blank(&c.relationship),
            is_primary: c.is_primary,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccidentEventData {
    pub accident_type: String,
    pub timestamp: String,
    pub confidence: f64,
    pub acceleration_magnitude: f64,
    pub gyroscope_magnitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_data: Option<LocationData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_sensor_data: Option<HashMap<String, serde_json::Value>>,
}

impl AccidentEventData {
    pub fn from_event(event: &AccidentEvent, location: Option<&LocationFix>) -> Self {
        AccidentEventData {
            accident_type: event.kind.wire_name().to_string(),
            timestamp: format_timestamp(&event.timestamp),
            confidence: event.confidence,
            acceleration_magnitude: event.acceleration_magnitude,
            gyroscope_magnitude: event.gyroscope_magnitude,
            location_data: location.or(event.location.as_ref()).map(LocationData::from),
            additional_sensor_data: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlertRequest {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub accident_event: AccidentEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_info: Option<MedicalInfo>,
    pub emergency_contacts: Vec<ContactData>,
    pub api_key: String,
}

impl EmergencyAlertRequest {
    /// Build the submission payload for a confirmed alert.
    pub fn from_alert(
        alert: &EmergencyAlert,
        contacts: &[EmergencyContact],
        device_id: &str,
        user_id: Option<&str>,
        api_key: &str,
    ) -> Self {
        EmergencyAlertRequest {
            device_id: device_id.to_string(),
            user_id: user_id.map(str::to_string),
            accident_event: AccidentEventData::from_event(
                &alert.accident_event,
                alert.location.as_ref(),
            ),
            medical_info: alert.medical_info.as_ref().map(MedicalInfo::from),
            emergency_contacts: contacts.iter().map(ContactData::from).collect(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateAlertStatusRequest {
    pub status: String,
}

/// Window summary posted to `api/v1/sensor-events`, used both for remote
/// classification and for labelled sample upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorEventRequest {
    pub device_id: String,
    /// Ground-truth label, when known
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_confidence: Option<f64>,
    pub acceleration_magnitude: f64,
    pub gyroscope_magnitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_variance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro_variance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_jerk: Option<f64>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<RawWindowInfo>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawWindowInfo {
    pub accel_count: usize,
    pub gyro_count: usize,
    pub window_ms: i64,
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertResponse {
    pub alert_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertStatusResponse {
    pub alert_id: String,
    pub status: String,
    pub device_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    pub accident_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub location_data: Option<LocationData>,
    #[serde(default)]
    pub emergency_contacts_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStatistics {
    #[serde(default)]
    pub total_alerts: u32,
    #[serde(default)]
    pub alerts_by_type: HashMap<String, u32>,
    #[serde(default)]
    pub alerts_by_status: HashMap<String, u32>,
    #[serde(default)]
    pub alerts_today: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertsListResponse {
    pub alerts: Vec<AlertStatusResponse>,
    pub pagination: Pagination,
    #[serde(default)]
    pub statistics: Option<AlertStatistics>,
}

/// Filters for `GET api/v1/alerts`
#[derive(Clone, Debug, PartialEq)]
pub struct AlertQuery {
    pub limit: u32,
    pub offset: u32,
    pub device_id: Option<String>,
    pub status: Option<String>,
}

impl Default for AlertQuery {
    fn default() -> Self {
        AlertQuery {
            limit: 50,
            offset: 0,
            device_id: None,
            status: None,
        }
    }
}

impl AlertQuery {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
        ];
        if let Some(d) = &self.device_id {
            pairs.push(("device_id", d.clone()));
        }
        if let Some(s) = &self.status {
            pairs.push(("status", s.clone()));
        }
        pairs
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub websocket_connections: u32,
    #[serde(default)]
    pub services: HashMap<String, bool>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorEventResponse {
    pub ok: bool,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// FastAPI-style error body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub detail: serde_json::Value,
}

impl ApiErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
