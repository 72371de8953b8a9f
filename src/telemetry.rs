//! Sensor-event telemetry.
//!
//! Two kinds of uploads share the submission queue: periodic unlabelled
//! summaries of recent motion, and labelled samples of the window behind a
//! resolved alert (`FALSE_ALARM` when the user cancelled, the accident type
//! otherwise) which the backend uses as training data.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::api::models::SensorEventResponse;
use crate::api::submission::SubmissionService;
use crate::detection::{build_sensor_event, classify_window, AccidentDetector};
use crate::error::EngineResult;
use crate::types::{AccidentType, AlertStatus, EmergencyAlert, SensorSample};

pub const FALSE_ALARM_LABEL: &str = "FALSE_ALARM";

/// Label for a resolved alert, `None` while it is still pending.
pub fn label_for(alert: &EmergencyAlert) -> Option<&'static str> {
    match alert.status {
        AlertStatus::Pending => None,
        AlertStatus::Cancelled => Some(FALSE_ALARM_LABEL),
        AlertStatus::Confirmed | AlertStatus::Sent | AlertStatus::Failed => {
            Some(alert.accident_event.kind.upper_name())
        }
    }
}

/// Upload `window` with a ground-truth `label`. Queued for replay on transient failure.
pub async fn send_labelled_sample(
    submission: &SubmissionService,
    device_id: &str,
    window: &[SensorSample],
    label: &str,
    prediction: Option<(AccidentType, f64)>,
) -> EngineResult<SensorEventResponse> {
    let request = build_sensor_event(device_id, window, Utc::now(), Some(label), prediction);
    let response = submission.submit_sensor_event(&request).await?;
    info!(
        "[telemetry] Labelled sample {} uploaded ({} samples)",
        label,
        window.len()
    );
    Ok(response)
}

/// Periodically summarizes the detector's recent samples.
pub struct TelemetryReporter {
    detector: Arc<Mutex<AccidentDetector>>,
    submission: Arc<SubmissionService>,
    device_id: String,
    interval: Duration,
    window: Duration,
}

impl TelemetryReporter {
    pub fn new(
        detector: Arc<Mutex<AccidentDetector>>,
        submission: Arc<SubmissionService>,
        device_id: &str,
        interval: Duration,
        window: Duration,
    ) -> Self {
        TelemetryReporter {
            detector,
            submission,
            device_id: device_id.to_string(),
            interval,
            window,
        }
    }

    /// Send one summary. Returns false when there was nothing to report.
    pub async fn report_once(&self) -> EngineResult<bool> {
        let (samples, prediction) = {
            let detector = self.detector.lock().await;
            let samples = detector.recent_span(self.window.as_secs_f64());
            let prediction = classify_window(detector.config(), &samples);
            (samples, prediction)
        };
        if samples.is_empty() {
            return Ok(false);
        }
        let request = build_sensor_event(&self.device_id, &samples, Utc::now(), None, prediction);
        self.submission.submit_sensor_event(&request).await?;
        debug!("[telemetry] Reported {} samples", samples.len());
        Ok(true)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.report_once().await {
                    warn!("[telemetry] Report failed: {}", e);
                }
            }
        })
    }
}
