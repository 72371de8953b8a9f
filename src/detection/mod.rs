//! Accident detection pipeline: calibration, feature extraction, rule and
//! ensemble classification, confidence fusion and remote arbitration.

pub mod calibration;
pub mod detector;
pub mod ensemble;
pub mod features;
pub mod fusion;
pub mod remote;
pub mod rules;

pub use detector::{
    classify_window, spawn_analysis, AccidentDetector, Candidate, Detection, DetectorStats,
    RemoteQuery,
};
pub use remote::{build_sensor_event, map_label, ApiRemoteClassifier, RemoteClassifier};
