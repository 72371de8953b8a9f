//! Background monitoring service.
//!
//! `start` wires the pipeline together:
//!
//! ```text
//! source ──▶ health tap ──▶ analysis ──▶ detection forwarder ──▶ AlertManager
//!                                                       └──▶ labelled sample upload
//! ```
//!
//! plus the connectivity monitor, telemetry, the status writer and the
//! silence watchdog. `stop` aborts all of them and releases the wake lock.

use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::alert::{AlertDeps, AlertManager};
use crate::api::SubmissionService;
use crate::config::EngineConfig;
use crate::detection::{spawn_analysis, AccidentDetector, Detection, RemoteClassifier};
use crate::error::{EngineError, EngineResult};
use crate::health_monitor::{spawn_watchdog, SensorHealth};
use crate::live_status::{current_timestamp, EngineStatus};
use crate::platform::{WakeGuard, WakeLock};
use crate::sensors::SampleSource;
use crate::telemetry::{label_for, send_labelled_sample, TelemetryReporter};
use crate::types::{AccidentType, EmergencyAlert, SensorSample};

const DETECTION_CHANNEL: usize = 8;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

struct Running {
    guard: Box<dyn WakeGuard>,
    tasks: Vec<JoinHandle<()>>,
    started: Instant,
}

/// Everything the status writer needs, cheap to clone into a task.
#[derive(Clone)]
struct StatusProbe {
    detector: Arc<Mutex<AccidentDetector>>,
    alerts: AlertManager,
    submission: Option<Arc<SubmissionService>>,
    health: SensorHealth,
}

impl StatusProbe {
    async fn snapshot(&self, started: Option<Instant>) -> EngineStatus {
        let mut status = EngineStatus::new();
        status.running = started.is_some();
        status.uptime_seconds = started.map(|s| s.elapsed().as_secs()).unwrap_or(0);
        {
            let detector = self.detector.lock().await;
            status.set_detector(
                detector.stats(),
                detector.is_calibrated(),
                detector.calibration_progress(),
            );
        }
        status.set_alert(self.alerts.current().as_ref(), self.alerts.pending_calls());
        if let Some(submission) = &self.submission {
            status.pending_submissions = submission.pending_len();
            status.connectivity = submission.connectivity();
        }
        status.set_health(self.health.report());
        status.timestamp = current_timestamp();
        status
    }
}

pub struct MonitoringService {
    config: EngineConfig,
    source: Arc<dyn SampleSource>,
    wake_lock: Arc<dyn WakeLock>,
    detector: Arc<Mutex<AccidentDetector>>,
    alerts: AlertManager,
    submission: Option<Arc<SubmissionService>>,
    health: SensorHealth,
    running: Mutex<Option<Running>>,
}

impl MonitoringService {
    /// Build the service. `remote` enables arbitration of ambiguous detections.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn SampleSource>,
        wake_lock: Arc<dyn WakeLock>,
        deps: AlertDeps,
        remote: Option<Arc<dyn RemoteClassifier>>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let mut detector =
            AccidentDetector::new(config.detection.clone(), config.arbitration.clone())?;
        if let Some(remote) = remote {
            detector = detector.with_remote(remote, &config.api.device_id);
        }
        let submission = deps.submission.clone();
        let alerts = AlertManager::new(config.alert.clone(), deps);
        let health = SensorHealth::new("Accelerometer", config.monitor.accel_silence_secs);

        Ok(MonitoringService {
            source,
            wake_lock,
            detector: Arc::new(Mutex::new(detector)),
            alerts,
            submission,
            health,
            running: Mutex::new(None),
            config,
        })
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn detector(&self) -> &Arc<Mutex<AccidentDetector>> {
        &self.detector
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    fn probe(&self) -> StatusProbe {
        StatusProbe {
            detector: Arc::clone(&self.detector),
            alerts: self.alerts.clone(),
            submission: self.submission.clone(),
            health: self.health.clone(),
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let started = self.running.lock().await.as_ref().map(|r| r.started);
        self.probe().snapshot(started).await
    }

    pub async fn start(&self) -> EngineResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        if !self.source.has_accelerometer().await {
            error!("[monitor] {} source has no accelerometer", self.source.name());
            return Err(EngineError::SensorUnavailable);
        }
        let guard = self.wake_lock.acquire()?;
        let started = Instant::now();
        let monitor = &self.config.monitor;
        self.health.update();

        let mut tasks = Vec::new();
        let (source_tx, source_rx) = mpsc::channel(monitor.channel_capacity);
        let (sample_tx, sample_rx) = mpsc::channel(monitor.channel_capacity);
        let (detection_tx, detection_rx) = mpsc::channel(DETECTION_CHANNEL);

        let source = Arc::clone(&self.source);
        tasks.push(tokio::spawn(async move { source.run(source_tx).await }));
        tasks.push(spawn_health_tap(self.health.clone(), source_rx, sample_tx));
        tasks.push(spawn_analysis(Arc::clone(&self.detector), sample_rx, detection_tx));
        tasks.push(self.spawn_forwarder(detection_rx));

        if let Some(submission) = &self.submission {
            tasks.push(submission.spawn_connectivity_monitor());
            if monitor.telemetry_enabled {
                let reporter = TelemetryReporter::new(
                    Arc::clone(&self.detector),
                    Arc::clone(submission),
                    &self.config.api.device_id,
                    monitor.telemetry_interval,
                    monitor.telemetry_window,
                );
                tasks.push(reporter.spawn());
            }
        }
        if let Some(path) = &monitor.status_path {
            tasks.push(spawn_status_writer(
                self.probe(),
                path.clone(),
                monitor.status_interval,
                started,
            ));
        }
        tasks.push(spawn_watchdog(self.health.clone(), WATCHDOG_INTERVAL));

        info!(
            "[monitor] Monitoring started ({} source, {} tasks)",
            self.source.name(),
            tasks.len()
        );
        *running = Some(Running {
            guard,
            tasks,
            started,
        });
        Ok(())
    }

    pub async fn stop(&self) -> EngineResult<()> {
        let Some(mut run) = self.running.lock().await.take() else {
            return Err(EngineError::NotRunning);
        };
        for task in &run.tasks {
            task.abort();
        }
        self.alerts.shutdown();
        self.detector.lock().await.recalibrate();
        run.guard.release();
        info!(
            "[monitor] Monitoring stopped after {}s",
            run.started.elapsed().as_secs()
        );
        Ok(())
    }

    /// Hand detections to the alert manager. Each accepted detection resets
    /// the detector so the same impact is not reported twice.
    fn spawn_forwarder(&self, mut detections: mpsc::Receiver<Detection>) -> JoinHandle<()> {
        let alerts = self.alerts.clone();
        let detector = Arc::clone(&self.detector);
        let uploads = self
            .submission
            .clone()
            .filter(|_| self.config.monitor.upload_labelled_samples);
        let device_id = self.config.api.device_id.clone();

        tokio::spawn(async move {
            let mut labels = JoinSet::new();
            while let Some(detection) = detections.recv().await {
                let kind = detection.event.kind;
                let confidence = detection.event.confidence;
                match alerts.trigger(detection.event).await {
                    Ok(Some(id)) => {
                        detector.lock().await.reset();
                        if let Some(submission) = uploads.clone() {
                            let updates = alerts.subscribe();
                            let device_id = device_id.clone();
                            let window = detection.window;
                            labels.spawn(async move {
                                upload_when_resolved(
                                    updates,
                                    id,
                                    submission,
                                    device_id,
                                    window,
                                    (kind, confidence),
                                )
                                .await
                            });
                        }
                    }
                    Ok(None) => debug!("[monitor] {:?} dropped, alert already pending", kind),
                    Err(e) => error!("[monitor] Could not raise alert: {}", e),
                }
            }
            debug!("[monitor] Detection stream ended");
            while labels.join_next().await.is_some() {}
        })
    }
}

impl Drop for MonitoringService {
    fn drop(&mut self) {
        if let Some(run) = self.running.get_mut().take() {
            for task in &run.tasks {
                task.abort();
            }
            self.alerts.shutdown();
        }
    }
}

/// Record sample arrival for the silence watchdog, then pass samples on.
fn spawn_health_tap(
    health: SensorHealth,
    mut input: mpsc::Receiver<SensorSample>,
    output: mpsc::Sender<SensorSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = input.recv().await {
            health.update();
            if output.send(sample).await.is_err() {
                break;
            }
        }
        info!("[monitor] Sample source finished");
    })
}

/// Wait until alert `id` resolves, then upload its window labelled with the outcome.
async fn upload_when_resolved(
    mut updates: watch::Receiver<Option<EmergencyAlert>>,
    id: String,
    submission: Arc<SubmissionService>,
    device_id: String,
    window: Vec<SensorSample>,
    prediction: (AccidentType, f64),
) {
    let label = loop {
        {
            let current = updates.borrow_and_update();
            match current.as_ref() {
                Some(alert) if alert.id == id => {
                    if let Some(label) = label_for(alert) {
                        break label;
                    }
                }
                _ => return,
            }
        }
        if updates.changed().await.is_err() {
            return;
        }
    };
    if let Err(e) =
        send_labelled_sample(&submission, &device_id, &window, label, Some(prediction)).await
    {
        warn!("[telemetry] Labelled sample for {} not sent: {}", id, e);
    }
}

fn spawn_status_writer(
    probe: StatusProbe,
    path: PathBuf,
    every: Duration,
    started: Instant,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failing = false;
        loop {
            ticker.tick().await;
            let status = probe.snapshot(Some(started)).await;
            match status.save(&path) {
                Ok(()) => failing = false,
                Err(e) if !failing => {
                    warn!("[status] Cannot write {}: {}", path.display(), e);
                    failing = true;
                }
                Err(_) => {}
            }
        }
    })
}
