use crate::config::DetectionConfig;
use crate::detection::features::Features;
use crate::types::{AccidentType, SensorSample};

// Fixed rule constants
pub const COLLISION_TREND: f64 = 5.0;
pub const ROLLOVER_GYRO_TREND: f64 = 2.0;
const SUDDEN_STOP_MIN_WINDOW: usize = 5;
const SUDDEN_STOP_MIN_CONSISTENT: usize = 3;
const FALL_MIN_WINDOW: usize = 3;
const FALL_LOOKBACK: usize = 3;
const FALL_MIN_LOW: usize = 2;

/// Threshold pattern detectors evaluated on the same window every analysis tick.
pub struct RuleClassifier {
    acceleration_threshold: f64,
    gyroscope_threshold: f64,
    sudden_stop_threshold: f64,
    fall_threshold: f64,
}

impl RuleClassifier {
    pub fn new(config: &DetectionConfig) -> Self {
        RuleClassifier {
            acceleration_threshold: config.acceleration_threshold,
            gyroscope_threshold: config.gyroscope_threshold,
            sudden_stop_threshold: config.sudden_stop_threshold,
            fall_threshold: config.fall_threshold,
        }
    }

    pub fn is_collision(&self, f: &Features) -> bool {
        f.accel.magnitude > self.acceleration_threshold && f.accel.trend > COLLISION_TREND
    }

    pub fn is_rollover(&self, f: &Features) -> bool {
        f.gyro.magnitude > self.gyroscope_threshold && f.gyro.trend > ROLLOVER_GYRO_TREND
    }

    /// Sustained deceleration on the travel (Y) axis: several large deltas, not one spike.
    pub fn is_sudden_stop(&self, window: &[SensorSample]) -> bool {
        if window.len() < SUDDEN_STOP_MIN_WINDOW {
            return false;
        }
        let deltas: Vec<f64> = window
            .windows(2)
            .map(|pair| (pair[1].accel.y - pair[0].accel.y).abs())
            .collect();

        let significant = deltas.iter().any(|d| *d > self.sudden_stop_threshold);
        let consistent = deltas
            .iter()
            .filter(|d| **d > self.sudden_stop_threshold * 0.5)
            .count()
            >= SUDDEN_STOP_MIN_CONSISTENT;
        significant && consistent
    }

    /// Sustained low-g: the current sample and at least 2 of the last 3 below the fall threshold.
    pub fn is_fall(&self, f: &Features, window: &[SensorSample]) -> bool {
        if window.len() < FALL_MIN_WINDOW {
            return false;
        }
        let low = window
            .iter()
            .rev()
            .take(FALL_LOOKBACK)
            .filter(|s| s.accel_magnitude() < self.fall_threshold)
            .count();
        f.accel.magnitude < self.fall_threshold && low >= FALL_MIN_LOW
    }

    /// First matching pattern in severity order: collision, rollover, sudden stop, fall.
    pub fn select(&self, f: &Features, window: &[SensorSample]) -> Option<AccidentType> {
        if self.is_collision(f) {
            Some(AccidentType::Collision)
        } else if self.is_rollover(f) {
            Some(AccidentType::Rollover)
        } else if self.is_sudden_stop(window) {
            Some(AccidentType::SuddenStop)
        } else if self.is_fall(f, window) {
            Some(AccidentType::Fall)
        } else {
            None
        }
    }

    /// Independent pattern signals supporting `kind`. Whole-window patterns count double.
    pub fn pattern_matches(&self, kind: AccidentType, f: &Features, window: &[SensorSample]) -> u32 {
        match kind {
            AccidentType::Collision => {
                (f.accel.magnitude > self.acceleration_threshold) as u32
                    + (f.accel.trend > COLLISION_TREND) as u32
            }
            AccidentType::Rollover => {
                (f.gyro.magnitude > self.gyroscope_threshold) as u32
                    + (f.gyro.trend > ROLLOVER_GYRO_TREND) as u32
            }
            AccidentType::SuddenStop => {
                if self.is_sudden_stop(window) {
                    2
                } else {
                    0
                }
            }
            AccidentType::Fall => {
                if self.is_fall(f, window) {
                    2
                } else {
                    0
                }
            }
            AccidentType::Unknown => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::ensemble::EnsembleClassifier;
    use approx::assert_relative_eq;

    /// Ten quiet samples at ~9.8 m/s², then a steep impact ramp of 6 m/s² per sample
    /// (well past the smallest rise the collision trend allows).
    pub(crate) fn collision_window() -> Vec<SensorSample> {
        (0..20)
            .map(|i| {
                let t = i as f64 * 0.02;
                if i < 10 {
                    SensorSample::new(t, [0.1, 0.2, 9.8], [0.1, 0.0, 0.0])
                } else {
                    let z = 9.8 + 6.0 * (i - 9) as f64;
                    SensorSample::new(t, [0.0, 0.0, z], [0.2, 0.1, 0.0])
                }
            })
            .collect()
    }

    fn last_k(window: &[SensorSample], k: usize) -> &[SensorSample] {
        &window[window.len().saturating_sub(k)..]
    }

    #[test]
    fn test_collision_pattern_from_twenty_sample_window() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        let full = collision_window();
        assert_eq!(full.len(), 20);
        let window = last_k(&full, 10);
        let f = Features::extract(window);

        assert!(f.accel.magnitude > 15.0);
        assert!(f.accel.trend > 5.0, "trend was {}", f.accel.trend);
        assert_eq!(rules.select(&f, window), Some(AccidentType::Collision));
        assert_eq!(rules.pattern_matches(AccidentType::Collision, &f, window), 2);
    }

    /// 20 samples at 9.8 m/s² that jump to `high` for the last five.
    fn jump_window(high: f64) -> Vec<SensorSample> {
        (0..20)
            .map(|i| {
                let z = if i < 15 { 9.8 } else { high };
                SensorSample::new(i as f64 * 0.02, [0.0, 0.0, z], [0.0; 3])
            })
            .collect()
    }

    #[test]
    fn test_jump_to_25_needs_short_window_for_collision() {
        let full = jump_window(25.0);

        // over ten samples a rise confined to 9.8..25 cannot reach trend 5:
        // the steepest least-squares slope is a mid-window step, 15.2 * 12.5 / 82.5
        let default = DetectionConfig::default();
        let window = last_k(&full, default.window_size);
        let f = Features::extract(window);
        assert_relative_eq!(f.accel.magnitude, 25.0);
        assert_relative_eq!(f.accel.trend, 15.2 * 12.5 / 82.5, epsilon = 1e-9);
        assert!(!RuleClassifier::new(&default).is_collision(&f));
        // the ensemble still favours collision: 0.4 * 25/30 plus the low-gyro bonus
        let collision = EnsembleClassifier::new()
            .predict(&f)
            .probability(AccidentType::Collision);
        assert_relative_eq!(collision, 0.4 * 25.0 / 30.0 + 0.1, epsilon = 1e-9);

        // a four-sample window straddling the jump gives trend 0.4 * 15.2
        let short = DetectionConfig {
            window_size: 4,
            ..Default::default()
        };
        let window = last_k(&full[..17], short.window_size);
        let f = Features::extract(window);
        assert_relative_eq!(f.accel.trend, 0.4 * 15.2, epsilon = 1e-9);
        assert_eq!(
            RuleClassifier::new(&short).select(&f, window),
            Some(AccidentType::Collision)
        );
    }

    #[test]
    fn test_smallest_mid_window_jump_for_collision() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        // trend > 5 over ten samples needs a step above 5 * 82.5 / 12.5 = 33
        let f = Features::extract(last_k(&jump_window(9.8 + 32.0), 10));
        assert!(!rules.is_collision(&f));
        let window = jump_window(9.8 + 34.2);
        let f = Features::extract(last_k(&window, 10));
        assert!(f.accel.trend > 5.0, "trend was {}", f.accel.trend);
        assert_eq!(rules.select(&f, last_k(&window, 10)), Some(AccidentType::Collision));
    }

    #[test]
    fn test_quiet_window_selects_nothing() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        let window: Vec<SensorSample> = (0..10)
            .map(|i| SensorSample::new(i as f64 * 0.02, [0.0, 0.0, 9.8], [0.0; 3]))
            .collect();
        let f = Features::extract(&window);
        assert_eq!(rules.select(&f, &window), None);
    }

    #[test]
    fn test_rollover_pattern() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        let window: Vec<SensorSample> = (0..10)
            .map(|i| SensorSample::new(i as f64 * 0.02, [0.0, 0.0, 9.8], [i as f64 * 3.0, 0.0, 0.0]))
            .collect();
        let f = Features::extract(&window);
        assert!(f.gyro.magnitude > 6.0);
        assert_eq!(rules.select(&f, &window), Some(AccidentType::Rollover));
    }

    #[test]
    fn test_collision_wins_over_rollover() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        let window: Vec<SensorSample> = (0..10)
            .map(|i| {
                SensorSample::new(
                    i as f64 * 0.02,
                    [0.0, 0.0, 9.8 + i as f64 * 6.0],
                    [i as f64 * 3.0, 0.0, 0.0],
                )
            })
            .collect();
        let f = Features::extract(&window);
        assert!(rules.is_rollover(&f));
        assert_eq!(rules.select(&f, &window), Some(AccidentType::Collision));
    }

    #[test]
    fn test_sudden_stop_needs_consistency() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        // one spike of 9 on Y, everything else flat
        let ys = [0.0, 0.0, 0.0, 9.0, 9.0, 9.0];
        let spike: Vec<SensorSample> = ys
            .iter()
            .enumerate()
            .map(|(i, y)| SensorSample::new(i as f64 * 0.02, [0.0, *y, 0.0], [0.0; 3]))
            .collect();
        assert!(!rules.is_sudden_stop(&spike));

        // alternating deltas of 5, 9, 5
        let ys = [0.0, 5.0, -4.0, 1.0, 1.0, 1.0];
        let braking: Vec<SensorSample> = ys
            .iter()
            .enumerate()
            .map(|(i, y)| SensorSample::new(i as f64 * 0.02, [0.0, *y, 0.0], [0.0; 3]))
            .collect();
        assert!(rules.is_sudden_stop(&braking));
        let f = Features::extract(&braking);
        assert_eq!(rules.pattern_matches(AccidentType::SuddenStop, &f, &braking), 2);
    }

    #[test]
    fn test_sudden_stop_short_window() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        let window: Vec<SensorSample> = [0.0, 10.0, 0.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, y)| SensorSample::new(i as f64, [0.0, *y, 0.0], [0.0; 3]))
            .collect();
        assert!(!rules.is_sudden_stop(&window));
    }

    #[test]
    fn test_fall_needs_sustained_low_g() {
        let rules = RuleClassifier::new(&DetectionConfig::default());
        let mags = [9.8, 9.8, 9.8, 9.8, 1.0, 0.5];
        let window: Vec<SensorSample> = mags
            .iter()
            .enumerate()
            .map(|(i, m)| SensorSample::new(i as f64, [0.0, 0.0, *m], [0.0; 3]))
            .collect();
        let f = Features::extract(&window);
        assert_eq!(rules.select(&f, &window), Some(AccidentType::Fall));

        // a single low sample is not enough
        let mags = [9.8, 9.8, 9.8, 9.8, 9.8, 0.5];
        let window: Vec<SensorSample> = mags
            .iter()
            .enumerate()
            .map(|(i, m)| SensorSample::new(i as f64, [0.0, 0.0, *m], [0.0; 3]))
            .collect();
        let f = Features::extract(&window);
        assert!(!rules.is_fall(&f, &window));
    }
}
