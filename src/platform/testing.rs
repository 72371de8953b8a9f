//! Scripted and recording fakes shared by the unit tests.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{
    CallState, LocationProvider, MessagingGateway, NotificationChannel, TelephonyGateway,
    WakeGuard, WakeLock,
};
use crate::api::client::AlertApi;
use crate::api::models::{
    AlertQuery, AlertResponse, AlertStatusResponse, AlertsListResponse, EmergencyAlertRequest,
    HealthResponse, Pagination, SensorEventRequest, SensorEventResponse,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{AlertStatus, EmergencyAlert, LocationFix};

// ─── API ─────────────────────────────────────────────────────────────────────

/// Answers from queues of scripted results; an empty queue means success.
#[derive(Default)]
pub struct ScriptedApi {
    alert_results: Mutex<VecDeque<EngineResult<AlertResponse>>>,
    sensor_results: Mutex<VecDeque<EngineResult<SensorEventResponse>>>,
    health_results: Mutex<VecDeque<EngineResult<HealthResponse>>>,
    pub alerts: Mutex<Vec<EmergencyAlertRequest>>,
    pub sensor_events: Mutex<Vec<SensorEventRequest>>,
    pub status_updates: Mutex<Vec<(String, String)>>,
    /// Label returned by successful sensor-event posts
    pub sensor_label: Mutex<Option<String>>,
    /// Simulated latency of sensor-event posts
    pub sensor_delay: Mutex<Option<Duration>>,
    health_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_alert_result(&self, result: EngineResult<AlertResponse>) {
        self.alert_results.lock().unwrap().push_back(result);
    }

    pub fn push_sensor_result(&self, result: EngineResult<SensorEventResponse>) {
        self.sensor_results.lock().unwrap().push_back(result);
    }

    pub fn push_health_result(&self, result: EngineResult<HealthResponse>) {
        self.health_results.lock().unwrap().push_back(result);
    }

    pub fn set_sensor_label(&self, label: Option<&str>) {
        *self.sensor_label.lock().unwrap() = label.map(str::to_string);
    }

    pub fn alert_attempts(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }

    pub fn sensor_attempts(&self) -> usize {
        self.sensor_events.lock().unwrap().len()
    }

    pub fn health_probes(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertApi for ScriptedApi {
    async fn send_emergency_alert(
        &self,
        request: &EmergencyAlertRequest,
    ) -> EngineResult<AlertResponse> {
        let n = {
            let mut alerts = self.alerts.lock().unwrap();
            alerts.push(request.clone());
            alerts.len()
        };
        self.alert_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(AlertResponse {
                    alert_id: format!("remote_{}", n),
                    status: "PENDING".to_string(),
                    message: "received".to_string(),
                    timestamp: String::new(),
                })
            })
    }

    async fn get_alert(&self, alert_id: &str) -> EngineResult<AlertStatusResponse> {
        Err(EngineError::Api {
            status: 404,
            message: format!("{} not found", alert_id),
        })
    }

    async fn list_alerts(&self, query: &AlertQuery) -> EngineResult<AlertsListResponse> {
        Ok(AlertsListResponse {
            alerts: Vec::new(),
            pagination: Pagination {
                limit: query.limit,
                offset: query.offset,
                total: 0,
            },
            statistics: None,
        })
    }

    async fn update_alert_status(&self, alert_id: &str, status: &str) -> EngineResult<()> {
        self.status_updates
            .lock()
            .unwrap()
            .push((alert_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn send_sensor_event(
        &self,
        request: &SensorEventRequest,
    ) -> EngineResult<SensorEventResponse> {
        self.sensor_events.lock().unwrap().push(request.clone());
        let delay = *self.sensor_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let scripted = self.sensor_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(SensorEventResponse {
                ok: true,
                event_id: Some("evt".to_string()),
                label: self.sensor_label.lock().unwrap().clone(),
            })
        })
    }

    async fn health(&self) -> EngineResult<HealthResponse> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.health_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(HealthResponse {
                    status: "healthy".to_string(),
                    timestamp: String::new(),
                    database: "connected".to_string(),
                    websocket_connections: 0,
                    services: Default::default(),
                })
            })
    }
}

// ─── Location ────────────────────────────────────────────────────────────────

pub struct FakeLocation {
    last: Option<LocationFix>,
    fresh: Option<LocationFix>,
    fresh_requests: AtomicUsize,
}

impl FakeLocation {
    pub fn new(last: Option<LocationFix>, fresh: Option<LocationFix>) -> Self {
        FakeLocation {
            last,
            fresh,
            fresh_requests: AtomicUsize::new(0),
        }
    }

    pub fn fresh_requests(&self) -> usize {
        self.fresh_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn last_known(&self) -> Option<LocationFix> {
        self.last.clone()
    }

    async fn fresh_fix(&self, _timeout: Duration) -> Option<LocationFix> {
        self.fresh_requests.fetch_add(1, Ordering::SeqCst);
        self.fresh.clone()
    }
}

// ─── Messaging ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMessaging {
    pub sent: Mutex<Vec<(String, String, Instant)>>,
    /// Numbers whose delivery reports failure
    pub failing: Mutex<Vec<String>>,
    pub deny_permission: Mutex<bool>,
}

impl RecordingMessaging {
    pub fn numbers(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(n, _, _)| n.clone()).collect()
    }
}

#[async_trait]
impl MessagingGateway for RecordingMessaging {
    async fn send(&self, number: &str, text: &str) -> EngineResult<bool> {
        if *self.deny_permission.lock().unwrap() {
            return Err(EngineError::PermissionDenied("sms".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((number.to_string(), text.to_string(), Instant::now()));
        Ok(!self.failing.lock().unwrap().iter().any(|n| n == number))
    }
}

// ─── Telephony ───────────────────────────────────────────────────────────────

/// Records dial attempts; tests drive call state with [`ScriptedTelephony::emit`].
#[derive(Default)]
pub struct ScriptedTelephony {
    pub dialed: Mutex<Vec<(String, Instant)>>,
    /// Results for successive `place_call`s; empty means `Ok(true)`
    results: Mutex<VecDeque<EngineResult<bool>>>,
    observers: Mutex<Vec<UnboundedSender<CallState>>>,
}

impl ScriptedTelephony {
    pub fn push_result(&self, result: EngineResult<bool>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn emit(&self, state: CallState) {
        self.observers
            .lock()
            .unwrap()
            .retain(|tx| tx.unbounded_send(state).is_ok());
    }

    pub fn dialed_numbers(&self) -> Vec<String> {
        self.dialed.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dialed.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    /// Observers whose stream is still alive
    pub fn live_observers(&self) -> usize {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl TelephonyGateway for ScriptedTelephony {
    async fn place_call(&self, number: &str) -> EngineResult<bool> {
        self.dialed
            .lock()
            .unwrap()
            .push((number.to_string(), Instant::now()));
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(true))
    }

    fn observe_call_state(&self) -> BoxStream<'static, CallState> {
        let (tx, rx) = unbounded();
        self.observers.lock().unwrap().push(tx);
        rx.boxed()
    }
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum NotifyEvent {
    Pending(String),
    Result(AlertStatus, bool),
    Clear,
    AlarmOn(bool, bool),
    AlarmOff,
}

#[derive(Default)]
pub struct RecordingNotifications {
    pub events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifications {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl NotificationChannel for RecordingNotifications {
    fn show_pending(&self, alert: &EmergencyAlert) {
        self.events
            .lock()
            .unwrap()
            .push(NotifyEvent::Pending(alert.id.clone()));
    }

    fn show_result(&self, alert: &EmergencyAlert, success: bool) {
        self.events
            .lock()
            .unwrap()
            .push(NotifyEvent::Result(alert.status, success));
    }

    fn clear(&self) {
        self.events.lock().unwrap().push(NotifyEvent::Clear);
    }

    fn start_alarm(&self, sound: bool, vibrate: bool) {
        self.events
            .lock()
            .unwrap()
            .push(NotifyEvent::AlarmOn(sound, vibrate));
    }

    fn stop_alarm(&self) {
        self.events.lock().unwrap().push(NotifyEvent::AlarmOff);
    }
}

// ─── Wake lock ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingWakeLock {
    pub held: std::sync::Arc<AtomicUsize>,
}

struct CountingGuard {
    held: std::sync::Arc<AtomicUsize>,
    active: bool,
}

impl WakeGuard for CountingGuard {
    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for CountingGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self) -> EngineResult<Box<dyn WakeGuard>> {
        self.held.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingGuard {
            held: std::sync::Arc::clone(&self.held),
            active: true,
        }))
    }
}
