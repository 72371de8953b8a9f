//! Boundary traits for everything the engine does not own: location,
//! messaging, telephony, user notification, the profile store and the
//! wake lock. Implementations are injected as `Arc<dyn Trait>`.

pub mod location;
pub mod simulated;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::EngineResult;
use crate::types::{EmergencyAlert, LocationFix, ProfileSnapshot};

pub use location::emergency_location;

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Cached fix, possibly stale
    async fn last_known(&self) -> Option<LocationFix>;

    /// Request a new fix, giving up after `timeout`
    async fn fresh_fix(&self, timeout: Duration) -> Option<LocationFix>;
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Deliver `text` to `number`, splitting into segments as the carrier requires.
    /// `Ok(false)` means the gateway accepted the request but delivery failed.
    async fn send(&self, number: &str, text: &str) -> EngineResult<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    /// Off-hook
    Active,
}

#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Start dialing. `Ok(true)` once the call is initiated.
    async fn place_call(&self, number: &str) -> EngineResult<bool>;

    /// Call-state transitions from now on. Dropping the stream unregisters the observer.
    fn observe_call_state(&self) -> BoxStream<'static, CallState>;
}

pub trait NotificationChannel: Send + Sync {
    fn show_pending(&self, alert: &EmergencyAlert);
    fn show_result(&self, alert: &EmergencyAlert, success: bool);
    fn clear(&self);
    fn start_alarm(&self, sound: bool, vibrate: bool);
    fn stop_alarm(&self);
}

pub trait ProfileStore: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<ProfileSnapshot>;
}

/// Keeps the host awake while monitoring. Released on drop or `release()`.
pub trait WakeGuard: Send {
    fn release(&mut self);
}

pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> EngineResult<Box<dyn WakeGuard>>;
}
