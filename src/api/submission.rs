//! Alert submission with retry, a durable pending queue and connectivity-driven replay.
//!
//! A submission that exhausts its attempts is appended to the pending queue,
//! which is mirrored to a JSON file after every mutation. The connectivity
//! monitor polls `GET /health` and drains the queue whenever the backend is
//! reachable. Items leave the queue only after a confirmed success, so a
//! connectivity flap in the middle of a drain never loses or duplicates work.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::client::AlertApi;
use super::models::{AlertResponse, EmergencyAlertRequest, SensorEventRequest, SensorEventResponse};
use crate::config::ApiConfig;
use crate::error::{EngineError, EngineResult};

// ─── Pending queue ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PendingPayload {
    Alert(EmergencyAlertRequest),
    SensorEvent(SensorEventRequest),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub id: String,
    pub payload: PendingPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO of submissions awaiting replay, optionally mirrored to disk.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: Vec<PendingSubmission>,
    path: Option<PathBuf>,
    seq: u64,
}

impl PendingQueue {
    pub fn in_memory() -> Self {
        PendingQueue::default()
    }

    /// Load the queue from `path`. A missing file is an empty queue.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let items: Vec<PendingSubmission> = if path.exists() {
            let text = fs::read_to_string(path)?;
            if text.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            Vec::new()
        };

        if !items.is_empty() {
            info!("[queue] Loaded {} pending submission(s) from {}", items.len(), path.display());
        }
        Ok(PendingQueue {
            seq: items.len() as u64,
            items,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingSubmission> {
        self.items.clone()
    }

    pub fn push(&mut self, payload: PendingPayload) -> EngineResult<String> {
        self.seq += 1;
        let now = Utc::now();
        let id = format!("pending_{}_{}", now.timestamp_millis(), self.seq);
        self.items.push(PendingSubmission {
            id: id.clone(),
            payload,
            enqueued_at: now,
        });
        self.persist()?;
        Ok(id)
    }

    /// Remove by id. Returns false when the id is not queued.
    pub fn remove(&mut self, id: &str) -> EngineResult<bool> {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        if self.items.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    fn persist(&self) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.items)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Reject alert payloads the backend would refuse anyway.
pub fn validate_alert_request(request: &EmergencyAlertRequest) -> EngineResult<()> {
    if request.device_id.trim().is_empty() {
        return Err(EngineError::InvalidParameters("device_id is blank".to_string()));
    }
    let confidence = request.accident_event.confidence;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(EngineError::InvalidParameters(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }
    if request.emergency_contacts.is_empty() {
        return Err(EngineError::InvalidParameters(
            "no emergency contacts".to_string(),
        ));
    }
    if let Some(c) = request
        .emergency_contacts
        .iter()
        .find(|c| c.name.trim().is_empty() || c.phone.trim().is_empty())
    {
        return Err(EngineError::InvalidParameters(format!(
            "contact with blank name or phone ({:?} / {:?})",
            c.name, c.phone
        )));
    }
    Ok(())
}

// ─── Service ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Unknown,
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
}

pub struct SubmissionService {
    api: Arc<dyn AlertApi>,
    config: ApiConfig,
    queue: Mutex<PendingQueue>,
    drain_lock: tokio::sync::Mutex<()>,
    connectivity: watch::Sender<Connectivity>,
}

impl SubmissionService {
    /// Build the service, loading any queue left over at `config.pending_path`.
    pub fn new(api: Arc<dyn AlertApi>, config: ApiConfig) -> EngineResult<Self> {
        let queue = PendingQueue::load(&config.pending_path)?;
        Ok(Self::with_queue(api, config, queue))
    }

    pub fn with_queue(api: Arc<dyn AlertApi>, config: ApiConfig, queue: PendingQueue) -> Self {
        let (connectivity, _) = watch::channel(Connectivity::Unknown);
        SubmissionService {
            api,
            config,
            queue: Mutex::new(queue),
            drain_lock: tokio::sync::Mutex::new(()),
            connectivity,
        }
    }

    pub fn api(&self) -> &Arc<dyn AlertApi> {
        &self.api
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn pending_snapshot(&self) -> Vec<PendingSubmission> {
        self.queue.lock().map(|q| q.snapshot()).unwrap_or_default()
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    fn enqueue(&self, payload: PendingPayload) -> EngineResult<String> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| EngineError::lock_poisoned("pending queue"))?;
        let id = queue.push(payload)?;
        info!("[queue] Queued {} ({} pending)", id, queue.len());
        Ok(id)
    }

    fn dequeue(&self, id: &str) -> EngineResult<bool> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| EngineError::lock_poisoned("pending queue"))?;
        queue.remove(id)
    }

    /// Validate and submit, retrying transient failures. When every attempt
    /// fails the request is queued for replay and the last error is returned.
    pub async fn submit_alert(&self, request: &EmergencyAlertRequest) -> EngineResult<AlertResponse> {
        validate_alert_request(request)?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = EngineError::Internal("no attempt made".to_string());

        for attempt in 1..=attempts {
            match self.api.send_emergency_alert(request).await {
                Ok(response) => {
                    info!(
                        "[api] Alert submitted: remote id {} (attempt {}/{})",
                        response.alert_id, attempt, attempts
                    );
                    return Ok(response);
                }
                Err(e) if !e.is_retryable() => {
                    error!("[api] Alert rejected, not retrying: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("[api] Alert submission attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                    if attempt < attempts {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        if let Err(e) = self.enqueue(PendingPayload::Alert(request.clone())) {
            error!("[queue] Failed to queue alert: {}", e);
        }
        Err(last_error)
    }

    /// Single attempt; transient failures are queued for replay.
    pub async fn submit_sensor_event(
        &self,
        request: &SensorEventRequest,
    ) -> EngineResult<SensorEventResponse> {
        match self.api.send_sensor_event(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_retryable() {
                    debug!("[api] Sensor event failed, queueing: {}", e);
                    if let Err(qe) = self.enqueue(PendingPayload::SensorEvent(request.clone())) {
                        warn!("[queue] Failed to queue sensor event: {}", qe);
                    }
                } else {
                    warn!("[api] Sensor event rejected: {}", e);
                }
                Err(e)
            }
        }
    }

    pub async fn update_alert_status(&self, alert_id: &str, status: &str) -> EngineResult<()> {
        self.api.update_alert_status(alert_id, status).await
    }

    async fn replay(&self, payload: &PendingPayload) -> EngineResult<()> {
        match payload {
            PendingPayload::Alert(request) => self.api.send_emergency_alert(request).await.map(|r| {
                info!("[queue] Replayed alert, remote id {}", r.alert_id);
            }),
            PendingPayload::SensorEvent(request) => {
                self.api.send_sensor_event(request).await.map(|_| ())
            }
        }
    }

    /// Replay queued submissions in FIFO order, one attempt each.
    /// Concurrent callers wait for the running drain to finish.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let snapshot = self.pending_snapshot();
        let mut report = DrainReport::default();
        if snapshot.is_empty() {
            return report;
        }
        info!("[queue] Draining {} pending submission(s)", snapshot.len());

        for (i, item) in snapshot.iter().enumerate() {
            if i > 0 {
                sleep(self.config.drain_gap).await;
            }
            match self.replay(&item.payload).await {
                Ok(()) => {
                    if let Err(e) = self.dequeue(&item.id) {
                        error!("[queue] Sent {} but could not remove it: {}", item.id, e);
                    }
                    report.sent += 1;
                }
                Err(e @ EngineError::InvalidResponse { .. }) => {
                    // accepted upstream; replaying again would duplicate it
                    warn!("[queue] Replay of {} accepted with unreadable answer: {}", item.id, e);
                    if let Err(e) = self.dequeue(&item.id) {
                        error!("[queue] Could not remove {}: {}", item.id, e);
                    }
                    report.sent += 1;
                }
                Err(e) => {
                    warn!("[queue] Replay of {} failed: {}", item.id, e);
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.pending_len();
        info!(
            "[queue] Drain finished: {} sent, {} failed, {} remaining",
            report.sent, report.failed, report.remaining
        );
        report
    }

    /// One health probe. Returns true when the backend reported healthy.
    pub async fn check_health(&self) -> bool {
        let state = match self.api.health().await {
            Ok(h) if h.is_healthy() => Connectivity::Connected,
            Ok(h) => {
                debug!("[api] Backend reported status {:?}", h.status);
                Connectivity::Disconnected
            }
            Err(e) => {
                debug!("[api] Health probe failed: {}", e);
                Connectivity::Disconnected
            }
        };
        let previous = self.connectivity.send_replace(state);
        if previous != state {
            info!("[api] Connectivity {:?} -> {:?}", previous, state);
        }
        state == Connectivity::Connected
    }

    /// Poll health forever, draining on reconnection or whenever work is queued.
    pub fn spawn_connectivity_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let was_connected = service.connectivity() == Connectivity::Connected;
                let connected = service.check_health().await;
                if connected && (!was_connected || service.pending_len() > 0) {
                    service.drain().await;
                }
                let wait = if connected {
                    service.config.health_interval
                } else {
                    service.config.health_retry_interval
                };
                sleep(wait).await;
            }
        })
    }
}
