use serde::{Deserialize, Serialize};

use crate::detection::features::Features;
use crate::types::AccidentType;

/// Per-class scores in candidate order plus the winning class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccidentPrediction {
    pub kind: AccidentType,
    pub confidence: f64,
    pub probabilities: [(AccidentType, f64); 4],
}

impl AccidentPrediction {
    pub fn probability(&self, kind: AccidentType) -> f64 {
        self.probabilities
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }
}

/// Fixed-weight multi-factor scorer, one small classifier per accident class.
/// It never learns; the weights below are the whole model.
#[derive(Clone, Debug, Default)]
pub struct EnsembleClassifier;

impl EnsembleClassifier {
    pub fn new() -> Self {
        EnsembleClassifier
    }

    pub fn predict(&self, f: &Features) -> AccidentPrediction {
        let probabilities = [
            (AccidentType::Collision, score_collision(f)),
            (AccidentType::Rollover, score_rollover(f)),
            (AccidentType::SuddenStop, score_sudden_stop(f)),
            (AccidentType::Fall, score_fall(f)),
        ];

        // Strict comparison keeps the earliest class on ties
        let (kind, confidence) = probabilities
            .iter()
            .skip(1)
            .fold(probabilities[0], |best, cur| if cur.1 > best.1 { *cur } else { best });

        AccidentPrediction {
            kind,
            confidence,
            probabilities,
        }
    }
}

fn score_collision(f: &Features) -> f64 {
    let mut score = 0.0;
    // Sudden high acceleration
    if f.accel.magnitude > 15.0 {
        score += 0.4 * (f.accel.magnitude / 30.0).min(1.0);
    }
    // Stable motion before impact
    if f.accel.variability < 0.3 {
        score += 0.2;
    }
    if f.accel.trend > 5.0 {
        score += 0.3;
    }
    // Moderate rotation rules out rollover
    if f.gyro.magnitude < 8.0 {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

fn score_rollover(f: &Features) -> f64 {
    let mut score = 0.0;
    if f.gyro.magnitude > 6.0 {
        score += 0.5 * (f.gyro.magnitude / 15.0).min(1.0);
    }
    // Sustained rotation
    if f.gyro.trend > 2.0 {
        score += 0.3;
    }
    if f.accel.magnitude > 10.0 {
        score += 0.2;
    }
    score.clamp(0.0, 1.0)
}

fn score_sudden_stop(f: &Features) -> f64 {
    let mut score = 0.0;
    // Deceleration
    if f.accel.trend < -3.0 {
        score += 0.4 * (f.accel.trend.abs() / 10.0).min(1.0);
    }
    if (8.0..=20.0).contains(&f.accel.magnitude) {
        score += 0.3;
    }
    if f.gyro.magnitude < 5.0 {
        score += 0.2;
    }
    if f.accel.variability > 0.5 {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

fn score_fall(f: &Features) -> f64 {
    let mut score = 0.0;
    // Free fall: lower magnitude scores higher
    if f.accel.magnitude < 5.0 {
        score += 0.5 * (1.0 - f.accel.magnitude / 5.0);
    }
    if f.gyro.magnitude < 3.0 {
        score += 0.3;
    }
    if f.accel.trend < -2.0 {
        score += 0.2;
    }
    score.clamp(0.0, 1.0)
}
