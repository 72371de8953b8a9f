use std::fmt;
use tokio::time::Instant;

use crate::config::{ArbitrationConfig, DetectionConfig};
use crate::detection::features::Features;
use crate::types::AccidentType;

// ── Traditional score weights ──
const MAGNITUDE_WEIGHT: f64 = 0.2;
const GYRO_WEIGHT: f64 = 0.1;
const TREND_WEIGHT: f64 = 0.1;
const PATTERN_WEIGHT: f64 = 0.1;
const ML_SHARE: f64 = 0.5;

/// Threshold-ratio score of the rule-selected candidate.
pub fn traditional_score(f: &Features, pattern_matches: u32, config: &DetectionConfig) -> f64 {
    let magnitude_ratio = (f.accel.magnitude / config.acceleration_threshold).min(2.0);
    let gyro_ratio = (f.gyro.magnitude / config.gyroscope_threshold).min(2.0);
    let trend_factor = (f.accel.trend.abs() / 10.0).min(1.0);
    let pattern_factor = (pattern_matches as f64 / 3.0).min(1.0);

    magnitude_ratio * MAGNITUDE_WEIGHT
        + gyro_ratio * GYRO_WEIGHT
        + trend_factor * TREND_WEIGHT
        + pattern_factor * PATTERN_WEIGHT
}

/// Even blend of ensemble probability and traditional score, clamped to [0, 1].
pub fn fuse(ml_probability: f64, traditional: f64) -> f64 {
    (ml_probability * ML_SHARE + traditional * (1.0 - ML_SHARE)).clamp(0.0, 1.0)
}

/// Why a remote query was not made this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    OutOfBand,
    Throttled,
    SameEpisode,
    WeakCandidate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "remote arbitration disabled"),
            SkipReason::OutOfBand => write!(f, "local confidence outside intermediate band"),
            SkipReason::Throttled => write!(f, "query throttle active"),
            SkipReason::SameEpisode => write!(f, "same candidate within episode cooldown"),
            SkipReason::WeakCandidate => write!(f, "weak candidate"),
        }
    }
}

/// Throttle and episode bookkeeping for remote classification.
pub struct RemoteArbiter {
    config: ArbitrationConfig,
    last_query_at: Option<Instant>,
    last_kind: Option<AccidentType>,
    last_kind_at: Option<Instant>,
}

impl RemoteArbiter {
    pub fn new(config: ArbitrationConfig) -> Self {
        RemoteArbiter {
            config,
            last_query_at: None,
            last_kind: None,
            last_kind_at: None,
        }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    /// Ok when every gate is open: band, throttle, new episode, strong candidate.
    pub fn check(
        &self,
        kind: AccidentType,
        ml_probability: f64,
        pattern_matches: u32,
        now: Instant,
    ) -> Result<(), SkipReason> {
        if !self.config.enabled {
            return Err(SkipReason::Disabled);
        }
        if ml_probability < self.config.band_min || ml_probability > self.config.band_max {
            return Err(SkipReason::OutOfBand);
        }
        if let Some(last) = self.last_query_at {
            if now.saturating_duration_since(last) < self.config.query_throttle {
                return Err(SkipReason::Throttled);
            }
        }
        if self.last_kind == Some(kind) {
            if let Some(at) = self.last_kind_at {
                if now.saturating_duration_since(at) < self.config.episode_cooldown {
                    return Err(SkipReason::SameEpisode);
                }
            }
        }
        if pattern_matches < self.config.min_pattern_matches {
            return Err(SkipReason::WeakCandidate);
        }
        Ok(())
    }

    /// Start the throttle and episode clocks for an attempted query.
    pub fn record_query(&mut self, kind: AccidentType, now: Instant) {
        self.last_query_at = Some(now);
        self.last_kind = Some(kind);
        self.last_kind_at = Some(now);
    }

    /// Apply the remote verdict to a fused confidence.
    /// `None` (no opinion or failure) leaves it unchanged.
    pub fn adjust(&self, fused: f64, kind: AccidentType, remote: Option<AccidentType>) -> f64 {
        let adjusted = match remote {
            Some(r) if r == kind => fused + self.config.agree_bonus,
            Some(AccidentType::Unknown) | None => fused,
            Some(_) => fused - self.config.disagree_penalty,
        };
        adjusted.clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.last_query_at = None;
        self.last_kind = None;
        self.last_kind_at = None;
    }
}
