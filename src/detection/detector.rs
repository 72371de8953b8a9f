//! Streaming accident detector.
//!
//! Every calibrated sample enters a bounded ring buffer. Every
//! `analysis_stride`-th buffered sample triggers one analysis of the last
//! `window_size` samples: rules pick a candidate, the ensemble scores it,
//! both are fused, and an ambiguous candidate may be arbitrated remotely.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration, Instant};

use super::calibration::Calibrator;
use super::ensemble::EnsembleClassifier;
use super::features::Features;
use super::fusion::{fuse, traditional_score, RemoteArbiter};
use super::remote::{build_sensor_event, RemoteClassifier};
use super::rules::RuleClassifier;
use crate::api::models::SensorEventRequest;
use crate::config::{ArbitrationConfig, DetectionConfig};
use crate::error::EngineResult;
use crate::types::{AccidentEvent, AccidentType, SensorSample};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub samples_received: u64,
    pub samples_analyzed: u64,
    pub detections: u64,
    pub remote_queries: u64,
}

/// An emitted event together with the window it was detected on.
#[derive(Clone, Debug)]
pub struct Detection {
    pub event: AccidentEvent,
    pub window: Vec<SensorSample>,
}

pub struct AccidentDetector {
    config: DetectionConfig,
    calibrator: Calibrator,
    rules: RuleClassifier,
    ensemble: EnsembleClassifier,
    arbiter: RemoteArbiter,
    remote: Option<Arc<dyn RemoteClassifier>>,
    device_id: String,
    buffer: VecDeque<SensorSample>,
    since_analysis: usize,
    /// Bumped by every reset so in-flight candidates can be recognised as stale
    generation: u64,
    stats: DetectorStats,
}

impl AccidentDetector {
    pub fn new(config: DetectionConfig, arbitration: ArbitrationConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(AccidentDetector {
            calibrator: Calibrator::new(&config),
            rules: RuleClassifier::new(&config),
            ensemble: EnsembleClassifier::new(),
            arbiter: RemoteArbiter::new(arbitration),
            remote: None,
            device_id: "unknown_device".to_string(),
            buffer: VecDeque::with_capacity(config.buffer_capacity),
            since_analysis: 0,
            generation: 0,
            stats: DetectorStats::default(),
            config,
        })
    }

    /// Enable remote arbitration through `remote`, identifying as `device_id`.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteClassifier>, device_id: &str) -> Self {
        self.remote = Some(remote);
        self.device_id = device_id.to_string();
        self
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrator.is_calibrated()
    }

    pub fn calibration_progress(&self) -> (usize, usize) {
        self.calibrator.progress()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The last `n` filtered samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<SensorSample> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).cloned().collect()
    }

    /// Filtered samples no older than `span_secs` before the newest one.
    pub fn recent_span(&self, span_secs: f64) -> Vec<SensorSample> {
        let Some(newest) = self.buffer.back().map(|s| s.timestamp) else {
            return Vec::new();
        };
        self.buffer
            .iter()
            .filter(|s| newest - s.timestamp <= span_secs)
            .cloned()
            .collect()
    }

    /// Swap in a new configuration. Calibration is redone when its parameters changed.
    pub fn replace_config(&mut self, config: DetectionConfig) -> EngineResult<()> {
        config.validate()?;
        let recalibrate = config.calibration_samples != self.config.calibration_samples
            || config.noise_threshold != self.config.noise_threshold
            || config.gravity_alpha != self.config.gravity_alpha;
        if recalibrate {
            self.calibrator = Calibrator::new(&config);
            self.buffer.clear();
        }
        while self.buffer.len() > config.buffer_capacity {
            self.buffer.pop_front();
        }
        self.rules = RuleClassifier::new(&config);
        self.config = config;
        info!("[detector] Configuration replaced (recalibrate: {})", recalibrate);
        Ok(())
    }

    /// Forget buffered samples and arbitration history. Calibration is kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.since_analysis = 0;
        self.generation += 1;
        self.arbiter.reset();
    }

    /// Full restart: also discards calibration and filter state.
    pub fn recalibrate(&mut self) {
        self.reset();
        self.calibrator.reset();
    }

    /// Feed one raw sample. Returns a detection when this sample's analysis produced one.
    pub async fn process(&mut self, raw: &SensorSample) -> Option<Detection> {
        let mut candidate = self.ingest(raw)?;
        let verdict = match candidate.take_query() {
            Some(query) => query.run().await,
            None => None,
        };
        self.resolve(candidate, verdict)
    }

    /// Classify one window whose last sample is the current one.
    pub async fn analyze(&mut self, window: &[SensorSample]) -> Option<AccidentEvent> {
        let mut candidate = self.evaluate(window.to_vec())?;
        let verdict = match candidate.take_query() {
            Some(query) => query.run().await,
            None => None,
        };
        self.resolve(candidate, verdict).map(|d| d.event)
    }

    /// Buffer one raw sample and, on analysis ticks, score the current window.
    /// A returned candidate may carry a remote query to run before [`resolve`].
    ///
    /// [`resolve`]: AccidentDetector::resolve
    pub fn ingest(&mut self, raw: &SensorSample) -> Option<Candidate> {
        self.stats.samples_received += 1;
        let sample = self.calibrator.process(raw)?;

        if self.buffer.len() >= self.config.buffer_capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);

        self.since_analysis += 1;
        if self.since_analysis < self.config.analysis_stride {
            return None;
        }
        self.since_analysis = 0;

        if self.buffer.len() < self.config.window_size {
            return None;
        }
        let window = self.recent(self.config.window_size);
        self.evaluate(window)
    }

    /// Local scoring of `window`. Starts the arbitration clocks when a
    /// remote query is warranted.
    fn evaluate(&mut self, window: Vec<SensorSample>) -> Option<Candidate> {
        self.stats.samples_analyzed += 1;
        let f = Features::extract(&window);
        let kind = self.rules.select(&f, &window)?;
        let matches = self.rules.pattern_matches(kind, &f, &window);

        let prediction = self.ensemble.predict(&f);
        let ml = prediction.probability(kind);
        let traditional = traditional_score(&f, matches, &self.config);
        let confidence = fuse(ml, traditional);
        debug!(
            "[detector] {:?}: ml {:.3}, traditional {:.3}, matches {}, fused {:.3}",
            kind, ml, traditional, matches, confidence
        );

        let mut query = None;
        if let Some(remote) = self.remote.clone() {
            let now = Instant::now();
            match self.arbiter.check(kind, ml, matches, now) {
                Ok(()) => {
                    self.arbiter.record_query(kind, now);
                    self.stats.remote_queries += 1;
                    let request = build_sensor_event(
                        &self.device_id,
                        &window,
                        Utc::now(),
                        None,
                        Some((prediction.kind, prediction.confidence)),
                    );
                    query = Some(RemoteQuery {
                        remote,
                        request,
                        timeout: self.arbiter.config().timeout,
                    });
                }
                Err(reason) => debug!("[detector] Remote query skipped: {}", reason),
            }
        }

        Some(Candidate {
            kind,
            confidence,
            queried: query.is_some(),
            query,
            accel_magnitude: f.accel.magnitude,
            gyro_magnitude: f.gyro.magnitude,
            window,
            generation: self.generation,
        })
    }

    /// Apply a remote verdict and the emission threshold. Candidates scored
    /// before the last reset are dropped.
    pub fn resolve(
        &mut self,
        candidate: Candidate,
        verdict: Option<AccidentType>,
    ) -> Option<Detection> {
        if candidate.generation != self.generation {
            debug!("[detector] Dropping {:?} candidate from before reset", candidate.kind);
            return None;
        }
        let kind = candidate.kind;
        let mut confidence = candidate.confidence;
        if candidate.queried {
            let adjusted = self.arbiter.adjust(confidence, kind, verdict);
            debug!(
                "[detector] Remote verdict {:?} for {:?}: {:.3} -> {:.3}",
                verdict, kind, confidence, adjusted
            );
            confidence = adjusted;
        }
        if confidence < self.config.minimum_confidence {
            return None;
        }

        self.stats.detections += 1;
        warn!(
            "[detector] Accident detected: {:?} (confidence {:.2}, accel {:.1} m/s², gyro {:.2} rad/s)",
            kind, confidence, candidate.accel_magnitude, candidate.gyro_magnitude
        );
        Some(Detection {
            event: AccidentEvent {
                timestamp: Utc::now(),
                acceleration_magnitude: candidate.accel_magnitude,
                gyroscope_magnitude: candidate.gyro_magnitude,
                location: None,
                confidence,
                kind,
            },
            window: candidate.window,
        })
    }
}

/// A locally scored window, waiting for its optional remote verdict.
pub struct Candidate {
    pub kind: AccidentType,
    /// Fused local confidence before arbitration
    pub confidence: f64,
    queried: bool,
    query: Option<RemoteQuery>,
    accel_magnitude: f64,
    gyro_magnitude: f64,
    window: Vec<SensorSample>,
    generation: u64,
}

impl Candidate {
    pub fn take_query(&mut self) -> Option<RemoteQuery> {
        self.query.take()
    }
}

/// One remote classification, run without access to the detector.
pub struct RemoteQuery {
    remote: Arc<dyn RemoteClassifier>,
    request: SensorEventRequest,
    timeout: Duration,
}

impl RemoteQuery {
    /// The remote label, or `None` on failure, timeout or no opinion.
    pub async fn run(self) -> Option<AccidentType> {
        match timeout(self.timeout, self.remote.classify(&self.request)).await {
            Ok(Ok(label)) => label,
            Ok(Err(e)) => {
                warn!("[detector] Remote classification failed: {}", e);
                None
            }
            Err(_) => {
                warn!("[detector] Remote classification timed out");
                None
            }
        }
    }
}

/// Candidate type and scores without side effects, for offline inspection.
pub fn classify_window(
    config: &DetectionConfig,
    window: &[SensorSample],
) -> Option<(AccidentType, f64)> {
    let f = Features::extract(window);
    let rules = RuleClassifier::new(config);
    let kind = rules.select(&f, window)?;
    let matches = rules.pattern_matches(kind, &f, window);
    let ml = EnsembleClassifier::new().predict(&f).probability(kind);
    Some((kind, fuse(ml, traditional_score(&f, matches, config))))
}

/// Drain samples into the shared detector and forward detections.
///
/// Remote queries run as their own tasks, so the detector stays available
/// to other holders and samples keep flowing while a verdict is awaited.
pub fn spawn_analysis(
    detector: Arc<Mutex<AccidentDetector>>,
    mut samples: mpsc::Receiver<SensorSample>,
    detections: mpsc::Sender<Detection>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut queries = JoinSet::new();
        while let Some(sample) = samples.recv().await {
            while queries.try_join_next().is_some() {}

            let (detection, awaiting) = {
                let mut d = detector.lock().await;
                match d.ingest(&sample) {
                    Some(mut candidate) => match candidate.take_query() {
                        Some(query) => (None, Some((candidate, query))),
                        None => (d.resolve(candidate, None), None),
                    },
                    None => (None, None),
                }
            };

            if let Some((candidate, query)) = awaiting {
                let detector = Arc::clone(&detector);
                let detections = detections.clone();
                queries.spawn(async move {
                    let verdict = query.run().await;
                    let detection = detector.lock().await.resolve(candidate, verdict);
                    if let Some(d) = detection {
                        let _ = detections.send(d).await;
                    }
                });
            }
            if let Some(d) = detection {
                if detections.send(d).await.is_err() {
                    debug!("[detector] Detection receiver closed, stopping analysis");
                    return;
                }
            }
        }
        while queries.join_next().await.is_some() {}
        debug!("[detector] Sample stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::remote::ApiRemoteClassifier;
    use crate::detection::rules::tests::collision_window;
    use crate::error::EngineError;
    use crate::platform::testing::ScriptedApi;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn detector(config: DetectionConfig) -> AccidentDetector {
        AccidentDetector::new(config, ArbitrationConfig::default()).unwrap()
    }

    fn small_config() -> DetectionConfig {
        DetectionConfig {
            calibration_samples: 3,
            window_size: 3,
            buffer_capacity: 8,
            ..Default::default()
        }
    }

    fn quiet(t: f64) -> SensorSample {
        SensorSample::new(t, [0.0, 0.0, 9.81], [0.0; 3])
    }

    /// Rollover window whose local confidence sits in the arbitration band
    fn ambiguous_rollover() -> Vec<SensorSample> {
        (0..5)
            .map(|i| SensorSample::new(i as f64 * 0.02, [0.0, 0.0, 9.8], [2.5 * i as f64, 0.0, 0.0]))
            .collect()
    }

    fn remote_detector(api: Arc<ScriptedApi>) -> AccidentDetector {
        let config = DetectionConfig {
            window_size: 5,
            ..Default::default()
        };
        detector(config).with_remote(Arc::new(ApiRemoteClassifier::new(api)), "dev")
    }

    #[tokio::test]
    async fn test_collision_window_emits_event() {
        let mut d = detector(DetectionConfig::default());
        let window = collision_window();
        let event = d.analyze(&window[10..]).await.unwrap();
        assert_eq!(event.kind, AccidentType::Collision);
        // ml 0.8, traditional 0.4 + 0.2236/60 + 0.06 + 0.0667
        let traditional = 0.4 + 0.05f64.sqrt() / 60.0 + 0.06 + 0.2 / 3.0;
        assert_relative_eq!(event.confidence, 0.4 + traditional / 2.0, epsilon = 1e-9);
        assert_relative_eq!(event.acceleration_magnitude, 69.8, epsilon = 1e-9);
        assert_eq!(d.stats().detections, 1);
    }

    #[tokio::test]
    async fn test_event_only_at_or_above_minimum_confidence() {
        let window = collision_window();
        let (_, confidence) = classify_window(&DetectionConfig::default(), &window[10..]).unwrap();

        let mut at = detector(DetectionConfig {
            minimum_confidence: confidence,
            ..Default::default()
        });
        assert!(at.analyze(&window[10..]).await.is_some());

        let mut above = detector(DetectionConfig {
            minimum_confidence: confidence + 1e-6,
            ..Default::default()
        });
        assert!(above.analyze(&window[10..]).await.is_none());
    }

    #[tokio::test]
    async fn test_no_candidate_no_event() {
        let mut d = detector(DetectionConfig::default());
        let window: Vec<SensorSample> = (0..10).map(|i| quiet(i as f64)).collect();
        assert!(d.analyze(&window).await.is_none());
        assert_eq!(d.stats().samples_analyzed, 1);
    }

    #[tokio::test]
    async fn test_calibration_then_stride() {
        let mut d = detector(small_config());
        for i in 0..3 {
            assert!(d.process(&quiet(i as f64)).await.is_none());
        }
        assert!(d.is_calibrated());
        assert_eq!(d.buffered(), 0);

        for i in 3..12 {
            d.process(&quiet(i as f64)).await;
        }
        assert_eq!(d.buffered(), 8);
        assert_eq!(d.stats().samples_received, 12);
        // 9 buffered samples, stride 3
        assert_eq!(d.stats().samples_analyzed, 3);
    }

    #[tokio::test]
    async fn test_ring_buffer_bounded() {
        let mut d = detector(small_config());
        for i in 0..100 {
            d.process(&quiet(i as f64)).await;
            assert!(d.buffered() <= 8);
        }
        let recent = d.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].timestamp, 99.0);
        assert_eq!(d.recent_span(3.0).len(), 4);
    }

    #[tokio::test]
    async fn test_reset_and_recalibrate() {
        let mut d = detector(small_config());
        for i in 0..6 {
            d.process(&quiet(i as f64)).await;
        }
        d.reset();
        assert_eq!(d.buffered(), 0);
        assert!(d.is_calibrated());

        d.recalibrate();
        assert!(!d.is_calibrated());
        assert_eq!(d.calibration_progress(), (0, 3));
    }

    #[tokio::test]
    async fn test_replace_config() {
        let mut d = detector(small_config());
        for i in 0..6 {
            d.process(&quiet(i as f64)).await;
        }
        d.replace_config(DetectionConfig {
            acceleration_threshold: 20.0,
            ..small_config()
        })
        .unwrap();
        assert!(d.is_calibrated());
        assert_eq!(d.config().acceleration_threshold, 20.0);

        d.replace_config(DetectionConfig {
            calibration_samples: 10,
            ..small_config()
        })
        .unwrap();
        assert!(!d.is_calibrated());

        let bad = DetectionConfig {
            minimum_confidence: 2.0,
            ..small_config()
        };
        assert!(d.replace_config(bad).is_err());
        assert_eq!(d.config().calibration_samples, 10);
    }

    #[tokio::test]
    async fn test_remote_agreement_lifts_ambiguous_candidate() {
        let api = Arc::new(ScriptedApi::new());
        api.set_sensor_label(Some("accident_rollover"));
        let mut d = remote_detector(api.clone());

        let event = d.analyze(&ambiguous_rollover()).await.unwrap();
        assert_eq!(event.kind, AccidentType::Rollover);
        assert!(event.confidence >= 0.65);
        assert_eq!(d.stats().remote_queries, 1);

        let sent = api.sensor_events.lock().unwrap()[0].clone();
        assert_eq!(sent.predicted_label.as_deref(), Some("ROLLOVER"));
        assert_eq!(sent.label, None);
    }

    #[tokio::test]
    async fn test_without_remote_ambiguous_candidate_is_dropped() {
        let mut d = detector(DetectionConfig {
            window_size: 5,
            ..Default::default()
        });
        assert!(d.analyze(&ambiguous_rollover()).await.is_none());
    }

    #[tokio::test]
    async fn test_remote_disagreement_or_failure_does_not_emit() {
        let api = Arc::new(ScriptedApi::new());
        api.set_sensor_label(Some("fall"));
        let mut d = remote_detector(api.clone());
        assert!(d.analyze(&ambiguous_rollover()).await.is_none());

        let api = Arc::new(ScriptedApi::new());
        api.push_sensor_result(Err(EngineError::Network("down".to_string())));
        let mut d = remote_detector(api.clone());
        assert!(d.analyze(&ambiguous_rollover()).await.is_none());
        assert_eq!(api.sensor_attempts(), 1);

        // the failed attempt still started the throttle
        assert!(d.analyze(&ambiguous_rollover()).await.is_none());
        assert_eq!(api.sensor_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_fails_open() {
        let api = Arc::new(ScriptedApi::new());
        api.set_sensor_label(Some("rollover"));
        *api.sensor_delay.lock().unwrap() = Some(Duration::from_secs(10));
        let mut d = remote_detector(api.clone());

        let start = Instant::now();
        assert!(d.analyze(&ambiguous_rollover()).await.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_keeps_running_during_remote_query() {
        // constant gyro of 4 rad/s with no linear acceleration scores a fall
        // candidate with ml 0.5, inside the arbitration band
        let config = DetectionConfig {
            calibration_samples: 1,
            analysis_stride: 1,
            window_size: 5,
            minimum_confidence: 0.5,
            ..Default::default()
        };
        let api = Arc::new(ScriptedApi::new());
        api.set_sensor_label(Some("fall"));
        *api.sensor_delay.lock().unwrap() = Some(Duration::from_secs(3));
        let d = Arc::new(Mutex::new(
            detector(config).with_remote(Arc::new(ApiRemoteClassifier::new(api.clone())), "dev"),
        ));
        let (sample_tx, sample_rx) = mpsc::channel(64);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let handle = spawn_analysis(d.clone(), sample_rx, event_tx);

        let start = Instant::now();
        for i in 0..30 {
            let s = SensorSample::new(i as f64 * 0.02, [0.0, 0.0, 9.81], [4.0, 0.0, 0.0]);
            sample_tx.send(s).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the query is still in flight, yet the detector is free and every
        // sample was consumed
        {
            let guard = d.try_lock().expect("detector locked during remote query");
            assert_eq!(guard.stats().samples_received, 30);
            assert_eq!(guard.stats().remote_queries, 1);
            assert_eq!(guard.stats().detections, 0);
        }
        assert!(event_rx.try_recv().is_err());

        // agreement lifts 0.317 to 0.517, above the configured minimum
        let detection = event_rx.recv().await.unwrap();
        assert_eq!(detection.event.kind, AccidentType::Fall);
        assert_relative_eq!(detection.event.confidence, 0.25 + 0.4 / 6.0 + 0.2, epsilon = 1e-9);
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        drop(sample_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_candidate_dropped_after_reset() {
        let mut d = detector(DetectionConfig::default());
        let window = collision_window();
        let candidate = d.evaluate(window[10..].to_vec()).unwrap();
        d.reset();
        assert!(d.resolve(candidate, None).is_none());
        assert_eq!(d.stats().detections, 0);
    }

    #[tokio::test]
    async fn test_analysis_task_forwards_detections() {
        let config = DetectionConfig {
            calibration_samples: 1,
            analysis_stride: 1,
            ..Default::default()
        };
        let d = Arc::new(Mutex::new(detector(config)));
        let (sample_tx, sample_rx) = mpsc::channel(64);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let handle = spawn_analysis(d.clone(), sample_rx, event_tx);

        // first sample seeds gravity and calibrates; then an impact ramp
        sample_tx.send(quiet(0.0)).await.unwrap();
        for i in 1..=10 {
            let z = 9.81 + 20.0 * i as f64;
            sample_tx
                .send(SensorSample::new(i as f64 * 0.02, [0.0, 0.0, z], [0.0; 3]))
                .await
                .unwrap();
        }
        drop(sample_tx);

        let detection = event_rx.recv().await.unwrap();
        assert_eq!(detection.event.kind, AccidentType::Collision);
        assert_eq!(detection.window.len(), 10);
        handle.await.unwrap();
    }
}
