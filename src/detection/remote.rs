use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::api::client::AlertApi;
use crate::api::models::{format_timestamp, RawWindowInfo, SensorEventRequest};
use crate::detection::features::{mean_abs_jerk, variance};
use crate::error::EngineResult;
use crate::types::{AccidentType, SensorSample};

/// Second opinion on an ambiguous local detection.
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    /// `Ok(None)` when the remote side has no opinion.
    async fn classify(&self, request: &SensorEventRequest) -> EngineResult<Option<AccidentType>>;
}

/// Classifies by posting the window to `api/v1/sensor-events` and reading back `label`.
pub struct ApiRemoteClassifier {
    api: Arc<dyn AlertApi>,
}

impl ApiRemoteClassifier {
    pub fn new(api: Arc<dyn AlertApi>) -> Self {
        ApiRemoteClassifier { api }
    }
}

#[async_trait]
impl RemoteClassifier for ApiRemoteClassifier {
    async fn classify(&self, request: &SensorEventRequest) -> EngineResult<Option<AccidentType>> {
        let response = self.api.send_sensor_event(request).await?;
        Ok(response.label.as_deref().map(map_label))
    }
}

/// Map a remote label (English or Spanish, optionally `accident_`-prefixed) to a type.
pub fn map_label(label: &str) -> AccidentType {
    match label.trim().to_lowercase().as_str() {
        "collision" | "colision" | "accident_collision" => AccidentType::Collision,
        "rollover" | "volcadura" | "accident_rollover" => AccidentType::Rollover,
        "sudden_stop" | "frenado" | "accident_sudden_stop" => AccidentType::SuddenStop,
        "fall" | "caida" | "accident_fall" => AccidentType::Fall,
        _ => AccidentType::Unknown,
    }
}

/// Summarize a window as a sensor-event payload. The last sample is the current one.
pub fn build_sensor_event(
    device_id: &str,
    window: &[SensorSample],
    timestamp: DateTime<Utc>,
    label: Option<&str>,
    prediction: Option<(AccidentType, f64)>,
) -> SensorEventRequest {
    let accel: Vec<f64> = window.iter().map(|s| s.accel_magnitude()).collect();
    let gyro: Vec<f64> = window.iter().map(|s| s.gyro_magnitude()).collect();
    let window_ms = match (window.first(), window.last()) {
        (Some(first), Some(last)) => ((last.timestamp - first.timestamp) * 1000.0).round() as i64,
        _ => 0,
    };

    SensorEventRequest {
        device_id: device_id.to_string(),
        label: label.map(str::to_string),
        predicted_label: prediction.map(|(k, _)| k.upper_name().to_string()),
        prediction_confidence: prediction.map(|(_, p)| p),
        acceleration_magnitude: accel.last().copied().unwrap_or(0.0),
        gyroscope_magnitude: gyro.last().copied().unwrap_or(0.0),
        accel_variance: Some(variance(&accel)),
        gyro_variance: Some(variance(&gyro)),
        accel_jerk: Some(mean_abs_jerk(window)),
        timestamp: format_timestamp(&timestamp),
        raw_data: Some(RawWindowInfo {
            accel_count: accel.len(),
            gyro_count: gyro.len(),
            window_ms,
        }),
    }
}
