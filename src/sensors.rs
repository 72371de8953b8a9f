//! Sample sources feeding the detection pipeline.
//!
//! Every source pushes [`SensorSample`]s into a bounded channel. Live sources
//! use `try_send` and drop samples when the analysis side falls behind;
//! recorded sessions are replayed without loss.

use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::error::{EngineError, EngineResult};
use crate::types::SensorSample;

#[async_trait]
pub trait SampleSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this source can deliver accelerometer data at all.
    async fn has_accelerometer(&self) -> bool;

    /// Produce samples until the receiver closes or the source is exhausted.
    async fn run(&self, tx: Sender<SensorSample>);
}

/// Non-blocking push. Returns `false` once the receiver is gone.
fn offer(tx: &Sender<SensorSample>, sample: SensorSample, count: &mut u64, tag: &str) -> bool {
    match tx.try_send(sample) {
        Ok(_) => {
            *count += 1;
            if *count % 500 == 0 {
                debug!("[{}] {} samples", tag, count);
            }
            true
        }
        Err(TrySendError::Closed(_)) => {
            info!("[{}] Channel closed after {} samples", tag, count);
            false
        }
        Err(TrySendError::Full(_)) => {
            warn!("[{}] Channel full, dropping sample", tag);
            true
        }
    }
}

fn current_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ─── termux-sensor ───────────────────────────────────────────────────────────

/// Reads accelerometer and gyroscope through `termux-sensor`, one sample per tick.
/// Ticks where the read fails produce nothing; the silence watchdog reports
/// a reader that stays down.
pub struct TermuxSource {
    interval: Duration,
    program: String,
}

impl TermuxSource {
    pub fn new(interval: Duration) -> Self {
        TermuxSource {
            interval,
            program: "termux-sensor".to_string(),
        }
    }

    /// Use another executable speaking the `termux-sensor` interface.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    async fn read(&self) -> Option<SensorSample> {
        let output = Command::new(&self.program)
            .args(["-n", "1", "-s", "accelerometer,gyroscope"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let (accel, gyro) = parse_sensor_output(&text)?;
        Some(SensorSample::new(
            current_timestamp(),
            accel,
            gyro.unwrap_or([0.0; 3]),
        ))
    }
}

#[async_trait]
impl SampleSource for TermuxSource {
    fn name(&self) -> &'static str {
        "termux"
    }

    async fn has_accelerometer(&self) -> bool {
        self.read().await.is_some()
    }

    async fn run(&self, tx: Sender<SensorSample>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut count = 0u64;
        let mut failures = 0u64;

        loop {
            ticker.tick().await;
            let Some(sample) = self.read().await else {
                failures += 1;
                if failures == 1 || failures % 500 == 0 {
                    warn!("[termux] Sensor read failed, tick skipped ({} times)", failures);
                }
                continue;
            };
            if !offer(&tx, sample, &mut count, "termux") {
                break;
            }
        }
    }
}

/// Parse one `termux-sensor` reading.
///
/// Accepts the JSON form (`{"<name> Accelerometer": {"values": [x, y, z]}, ...}`)
/// and the older line form (`x=0.5, y=0.3, z=9.8`, accelerometer only).
pub fn parse_sensor_output(output: &str) -> Option<([f64; 3], Option<[f64; 3]>)> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(output.trim()) {
        let mut accel = None;
        let mut gyro = None;
        for (name, reading) in &map {
            let values = reading.get("values").and_then(parse_triple);
            let name = name.to_lowercase();
            if name.contains("accel") {
                accel = values;
            } else if name.contains("gyro") {
                gyro = values;
            }
        }
        return accel.map(|a| (a, gyro));
    }

    let mut xyz = [None; 3];
    for part in output.split(',') {
        let part = part.trim();
        let slot = if let Some(v) = part.strip_prefix("x=") {
            (0, v)
        } else if let Some(v) = part.strip_prefix("y=") {
            (1, v)
        } else if let Some(v) = part.strip_prefix("z=") {
            (2, v)
        } else {
            continue;
        };
        xyz[slot.0] = Some(slot.1.trim().parse::<f64>().ok()?);
    }
    Some(([xyz[0]?, xyz[1]?, xyz[2]?], None))
}

fn parse_triple(v: &Value) -> Option<[f64; 3]> {
    let arr = v.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    Some([arr[0].as_f64()?, arr[1].as_f64()?, arr[2].as_f64()?])
}

// ─── Mock generator ──────────────────────────────────────────────────────────

const COLLISION_RAMP: f64 = 20.0; // m/s² added per sample
const COLLISION_SAMPLES: u64 = 15;

/// Synthetic phone-at-rest signal with an optional scripted collision.
pub struct MockSource {
    interval: Duration,
    collision_at: Option<u64>,
    counter: AtomicU64,
}

impl MockSource {
    pub fn new(interval: Duration) -> Self {
        MockSource {
            interval,
            collision_at: None,
            counter: AtomicU64::new(0),
        }
    }

    /// Inject a collision (a steep rise on the Z axis) starting at sample `n`.
    pub fn with_collision_at(mut self, n: u64) -> Self {
        self.collision_at = Some(n);
        self
    }

    /// Deterministic sample `n`, timestamped relative to zero.
    pub fn sample_at(&self, n: u64) -> SensorSample {
        use std::f64::consts::PI;
        let t = n as f64 * self.interval.as_secs_f64();

        let mut z = 9.81 + (t * PI).sin() * 0.1;
        if let Some(start) = self.collision_at {
            if n >= start && n < start + COLLISION_SAMPLES {
                z += COLLISION_RAMP * (n - start + 1) as f64;
            }
        }

        SensorSample::new(
            t,
            [(t * 2.0 * PI).sin() * 0.05, (t * 2.0 * PI).cos() * 0.03, z],
            [
                (t * 0.5).sin() * 0.05,
                (t * 0.3).cos() * 0.03,
                (t * 1.0).sin() * 0.1,
            ],
        )
    }

    fn next_sample(&self) -> SensorSample {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut sample = self.sample_at(n);
        sample.timestamp = current_timestamp();
        sample
    }
}

#[async_trait]
impl SampleSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn has_accelerometer(&self) -> bool {
        true
    }

    async fn run(&self, tx: Sender<SensorSample>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut count = 0u64;
        loop {
            ticker.tick().await;
            if !offer(&tx, self.next_sample(), &mut count, "mock") {
                break;
            }
        }
    }
}

// ─── Recorded sessions ───────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum Recording {
    Bare(Vec<SensorSample>),
    Wrapped { samples: Vec<SensorSample> },
}

/// Load a recorded session (`.json` or `.json.gz`): a list of samples, or
/// an object with a `samples` list.
pub fn load_recording(path: &Path) -> EngineResult<Vec<SensorSample>> {
    let file = File::open(path)
        .map_err(|e| EngineError::Storage(format!("{}: {}", path.display(), e)))?;
    let mut reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    let recording: Recording = serde_json::from_str(&text)?;
    let mut samples = match recording {
        Recording::Bare(s) | Recording::Wrapped { samples: s } => s,
    };
    samples.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    Ok(samples)
}

/// Replays recorded samples, optionally paced by their original timestamps.
pub struct ReplaySource {
    samples: Vec<SensorSample>,
    realtime: bool,
}

impl ReplaySource {
    pub fn new(samples: Vec<SensorSample>, realtime: bool) -> Self {
        ReplaySource { samples, realtime }
    }

    pub fn from_file(path: &Path, realtime: bool) -> EngineResult<Self> {
        Ok(Self::new(load_recording(path)?, realtime))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[async_trait]
impl SampleSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn has_accelerometer(&self) -> bool {
        !self.samples.is_empty()
    }

    async fn run(&self, tx: Sender<SensorSample>) {
        let mut previous: Option<f64> = None;
        for sample in &self.samples {
            if self.realtime {
                if let Some(prev) = previous {
                    let gap = (sample.timestamp - prev).max(0.0);
                    sleep(Duration::from_secs_f64(gap)).await;
                }
                previous = Some(sample.timestamp);
            }
            if tx.send(sample.clone()).await.is_err() {
                info!("[replay] Channel closed");
                return;
            }
        }
        info!("[replay] Finished {} samples", self.samples.len());
    }
}
