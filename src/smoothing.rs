use nalgebra::Vector3;
use std::collections::VecDeque;

/// Length of the per-axis moving average
pub const MOVING_AVERAGE_LEN: usize = 5;

/// Per-axis moving average over the last few vectors.
/// Until the window fills, the average covers whatever has arrived.
pub struct MovingAverage {
    window: VecDeque<Vector3<f64>>,
    window_size: usize,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        MovingAverage {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Push a vector and return the current average
    pub fn apply(&mut self, value: Vector3<f64>) -> Vector3<f64> {
        self.window.push_back(value);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let sum: Vector3<f64> = self.window.iter().sum();
        sum / self.window.len() as f64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// Snap each axis to the baseline when it lies within `threshold` of it.
pub fn dead_zone(value: Vector3<f64>, baseline: &Vector3<f64>, threshold: f64) -> Vector3<f64> {
    Vector3::from_fn(|i, _| {
        if (value[i] - baseline[i]).abs() < threshold {
            baseline[i]
        } else {
            value[i]
        }
    })
}

/// Moving average followed by a dead zone around a calibrated baseline.
pub struct NoiseFilter {
    accel: MovingAverage,
    gyro: MovingAverage,
    threshold: f64,
}

impl NoiseFilter {
    pub fn new(threshold: f64) -> Self {
        NoiseFilter {
            accel: MovingAverage::new(MOVING_AVERAGE_LEN),
            gyro: MovingAverage::new(MOVING_AVERAGE_LEN),
            threshold,
        }
    }

    pub fn apply(
        &mut self,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
        accel_baseline: &Vector3<f64>,
        gyro_baseline: &Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let a = dead_zone(self.accel.apply(accel), accel_baseline, self.threshold);
        let g = dead_zone(self.gyro.apply(gyro), gyro_baseline, self.threshold);
        (a, g)
    }

    pub fn reset(&mut self) {
        self.accel.clear();
        self.gyro.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_value() {
        let mut avg = MovingAverage::new(5);
        let out = avg.apply(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(out, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_window_wrapping() {
        let mut avg = MovingAverage::new(2);
        avg.apply(Vector3::new(1.0, 0.0, 0.0));
        avg.apply(Vector3::new(2.0, 0.0, 0.0));
        let out = avg.apply(Vector3::new(3.0, 0.0, 0.0)); // drops 1.0
        assert_eq!(avg.len(), 2);
        assert_relative_eq!(out.x, 2.5);
    }

    #[test]
    fn test_full_window_average() {
        let mut avg = MovingAverage::new(MOVING_AVERAGE_LEN);
        let mut out = Vector3::zeros();
        for i in 1..=7 {
            out = avg.apply(Vector3::new(i as f64, 0.0, -(i as f64)));
        }
        // window holds 3..=7
        assert_relative_eq!(out.x, 5.0);
        assert_relative_eq!(out.z, -5.0);
    }

    #[test]
    fn test_dead_zone_snaps_small_deviation() {
        let baseline = Vector3::new(0.0, 0.0, 0.0);
        let out = dead_zone(Vector3::new(0.3, -0.49, 0.6), &baseline, 0.5);
        assert_eq!(out, Vector3::new(0.0, 0.0, 0.6));
    }

    #[test]
    fn test_noise_filter_reset() {
        let mut filter = NoiseFilter::new(0.5);
        let zero = Vector3::zeros();
        filter.apply(Vector3::new(10.0, 0.0, 0.0), zero, &zero, &zero);
        filter.reset();
        let (a, _) = filter.apply(Vector3::new(2.0, 0.0, 0.0), zero, &zero, &zero);
        assert_relative_eq!(a.x, 2.0);
    }
}
