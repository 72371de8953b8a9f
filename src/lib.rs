//! Accident detection and emergency alert orchestration.
//!
//! Motion samples flow through calibration, feature extraction and a
//! rule + ensemble classifier. A confident detection opens a cancellable
//! alert which, once confirmed, notifies emergency contacts by text message
//! and sequential voice calls and reports to a remote service with retry.

pub mod alert;
pub mod api;
pub mod config;
pub mod detection;
pub mod error;
pub mod health_monitor;
pub mod live_status;
pub mod monitor;
pub mod platform;
pub mod sensors;
pub mod smoothing;
pub mod telemetry;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use monitor::MonitoringService;
