//! Window statistics used by every classifier.
//!
//! All functions are O(n) over the window and tolerate short or empty input.

use serde::{Deserialize, Serialize};

use crate::types::SensorSample;

/// Statistics of one magnitude series
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    /// Magnitude of the current (most recent) sample
    pub magnitude: f64,
    pub mean: f64,
    pub std: f64,
    /// Least-squares slope of magnitude vs. sample index
    pub trend: f64,
    /// std / mean, 0 when mean is 0
    pub variability: f64,
}

impl SeriesStats {
    pub fn from_series(values: &[f64]) -> Self {
        let magnitude = values.last().copied().unwrap_or(0.0);
        let mean = mean(values);
        let std = variance(values).sqrt();
        let variability = if mean > 0.0 { std / mean } else { 0.0 };
        SeriesStats {
            magnitude,
            mean,
            std,
            trend: trend(values),
            variability,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub accel: SeriesStats,
    pub gyro: SeriesStats,
}

impl Features {
    /// Extract features from a window whose last element is the current sample.
    pub fn extract(window: &[SensorSample]) -> Self {
        let accel: Vec<f64> = window.iter().map(|s| s.accel_magnitude()).collect();
        let gyro: Vec<f64> = window.iter().map(|s| s.gyro_magnitude()).collect();
        Features {
            accel: SeriesStats::from_series(&accel),
            gyro: SeriesStats::from_series(&gyro),
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

/// Ordinary-least-squares slope against index 0..n. Zero for fewer than 2 points.
pub fn trend(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let sum_x = (n_f - 1.0) * n_f / 2.0;
    let sum_x2 = (n_f - 1.0) * n_f * (2.0 * n_f - 1.0) / 6.0;
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values
        .iter()
        .enumerate()
        .map(|(i, v)| i as f64 * v)
        .sum();

    let denom = n_f * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return 0.0;
    }
    (n_f * sum_xy - sum_x * sum_y) / denom
}

/// Mean absolute rate of change of acceleration magnitude (m/s³).
/// Pairs with a non-positive time step are skipped.
pub fn mean_abs_jerk(window: &[SensorSample]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for pair in window.windows(2) {
        let dt = pair[1].timestamp - pair[0].timestamp;
        if dt <= 0.0 {
            continue;
        }
        let da = pair[1].accel_magnitude() - pair[0].accel_magnitude();
        total += (da / dt).abs();
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}
