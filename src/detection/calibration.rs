use log::info;
use nalgebra::Vector3;

use crate::config::DetectionConfig;
use crate::smoothing::NoiseFilter;
use crate::types::SensorSample;

/// Gravity removal, baseline calibration and noise filtering.
///
/// Raw samples go through a low-pass gravity estimate; the remainder is linear
/// acceleration. The first `calibration_samples` linear readings establish a
/// per-axis baseline. Only after that does anything come out of [`Calibrator::process`].
pub struct Calibrator {
    calibration_samples: usize,
    gravity_alpha: f64,
    gravity: Vector3<f64>,
    gravity_initialized: bool,
    accumulated: Vec<Vector3<f64>>,
    accel_baseline: Vector3<f64>,
    gyro_baseline: Vector3<f64>,
    calibrated: bool,
    filter: NoiseFilter,
}

impl Calibrator {
    pub fn new(config: &DetectionConfig) -> Self {
        Calibrator {
            calibration_samples: config.calibration_samples,
            gravity_alpha: config.gravity_alpha,
            gravity: Vector3::zeros(),
            gravity_initialized: false,
            accumulated: Vec::with_capacity(config.calibration_samples),
            accel_baseline: Vector3::zeros(),
            gyro_baseline: Vector3::zeros(),
            calibrated: false,
            filter: NoiseFilter::new(config.noise_threshold),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Calibration samples collected so far (capped at the target count)
    pub fn progress(&self) -> (usize, usize) {
        let done = if self.calibrated {
            self.calibration_samples
        } else {
            self.accumulated.len()
        };
        (done, self.calibration_samples)
    }

    pub fn accel_baseline(&self) -> Vector3<f64> {
        self.accel_baseline
    }

    pub fn gyro_baseline(&self) -> Vector3<f64> {
        self.gyro_baseline
    }

    /// Feed one raw sample. Returns the filtered sample once calibrated,
    /// `None` while the sample was consumed for calibration.
    pub fn process(&mut self, raw: &SensorSample) -> Option<SensorSample> {
        let linear = self.remove_gravity(raw.accel);

        if !self.calibrated {
            self.accumulate(linear, raw.gyro);
            return None;
        }

        let (accel, gyro) =
            self.filter
                .apply(linear, raw.gyro, &self.accel_baseline, &self.gyro_baseline);
        Some(SensorSample {
            timestamp: raw.timestamp,
            accel,
            gyro,
        })
    }

    /// Discard all calibration and filter state
    pub fn reset(&mut self) {
        self.gravity = Vector3::zeros();
        self.gravity_initialized = false;
        self.accumulated.clear();
        self.accel_baseline = Vector3::zeros();
        self.gyro_baseline = Vector3::zeros();
        self.calibrated = false;
        self.filter.reset();
    }

    fn remove_gravity(&mut self, raw: Vector3<f64>) -> Vector3<f64> {
        // Seed with the first reading so the filter does not ramp up from zero
        if !self.gravity_initialized {
            self.gravity = raw;
            self.gravity_initialized = true;
        } else {
            let a = self.gravity_alpha;
            self.gravity = self.gravity * a + raw * (1.0 - a);
        }
        raw - self.gravity
    }

    fn accumulate(&mut self, linear: Vector3<f64>, gyro: Vector3<f64>) {
        self.accumulated.push(linear);
        if self.accumulated.len() < self.calibration_samples {
            return;
        }

        let sum: Vector3<f64> = self.accumulated.iter().sum();
        self.accel_baseline = sum / self.accumulated.len() as f64;
        self.gyro_baseline = gyro;
        self.calibrated = true;
        self.accumulated.clear();

        info!(
            "[calibration] Complete. Baseline accel=({:.3}, {:.3}, {:.3}) gyro=({:.3}, {:.3}, {:.3})",
            self.accel_baseline.x,
            self.accel_baseline.y,
            self.accel_baseline.z,
            self.gyro_baseline.x,
            self.gyro_baseline.y,
            self.gyro_baseline.z
        );
    }
}
