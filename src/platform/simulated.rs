//! Log-backed collaborators for the CLI and for running without a handset.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::{
    CallState, LocationProvider, MessagingGateway, NotificationChannel, ProfileStore,
    TelephonyGateway, WakeGuard, WakeLock,
};
use crate::alert::message::split_message;
use crate::error::EngineResult;
use crate::types::{EmergencyAlert, LocationFix, ProfileSnapshot};

/// Profile held in memory; `update` pushes a new snapshot to subscribers.
pub struct InMemoryProfileStore {
    tx: watch::Sender<ProfileSnapshot>,
}

impl InMemoryProfileStore {
    pub fn new(initial: ProfileSnapshot) -> Self {
        let (tx, _) = watch::channel(initial);
        InMemoryProfileStore { tx }
    }

    pub fn update(&self, snapshot: ProfileSnapshot) {
        self.tx.send_replace(snapshot);
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn subscribe(&self) -> watch::Receiver<ProfileSnapshot> {
        self.tx.subscribe()
    }
}

/// Fixed position, stamped with the current time on every request.
pub struct StaticLocation {
    fix: Option<LocationFix>,
}

impl StaticLocation {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        StaticLocation {
            fix: Some(LocationFix {
                latitude,
                longitude,
                accuracy,
                altitude: None,
                speed: None,
                time: chrono::Utc::now(),
            }),
        }
    }

    pub fn unavailable() -> Self {
        StaticLocation { fix: None }
    }

    fn now(&self) -> Option<LocationFix> {
        self.fix.clone().map(|mut f| {
            f.time = chrono::Utc::now();
            f
        })
    }
}

#[async_trait]
impl LocationProvider for StaticLocation {
    async fn last_known(&self) -> Option<LocationFix> {
        self.now()
    }

    async fn fresh_fix(&self, _timeout: Duration) -> Option<LocationFix> {
        self.now()
    }
}

pub struct LogMessaging;

#[async_trait]
impl MessagingGateway for LogMessaging {
    async fn send(&self, number: &str, text: &str) -> EngineResult<bool> {
        let parts = split_message(text);
        for (i, part) in parts.iter().enumerate() {
            info!("[sms] -> {} ({}/{}): {}", number, i + 1, parts.len(), part);
        }
        Ok(true)
    }
}

/// Every call rings for `ring_time` and then hangs up unanswered.
pub struct LogTelephony {
    ring_time: Duration,
    observers: Arc<Mutex<Vec<UnboundedSender<CallState>>>>,
}

impl LogTelephony {
    pub fn new(ring_time: Duration) -> Self {
        LogTelephony {
            ring_time,
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn broadcast(observers: &Mutex<Vec<UnboundedSender<CallState>>>, state: CallState) {
    if let Ok(mut list) = observers.lock() {
        list.retain(|tx| tx.unbounded_send(state).is_ok());
    }
}

#[async_trait]
impl TelephonyGateway for LogTelephony {
    async fn place_call(&self, number: &str) -> EngineResult<bool> {
        info!("[call] Dialing {}", number);
        let observers = Arc::clone(&self.observers);
        let ring_time = self.ring_time;
        tokio::spawn(async move {
            broadcast(&observers, CallState::Ringing);
            tokio::time::sleep(ring_time).await;
            broadcast(&observers, CallState::Idle);
        });
        Ok(true)
    }

    fn observe_call_state(&self) -> BoxStream<'static, CallState> {
        let (tx, rx) = unbounded();
        match self.observers.lock() {
            Ok(mut list) => list.push(tx),
            Err(_) => warn!("[call] Observer registry unavailable"),
        }
        rx.boxed()
    }
}

pub struct LogNotifications;

impl NotificationChannel for LogNotifications {
    fn show_pending(&self, alert: &EmergencyAlert) {
        warn!(
            "[notify] {} detected ({:.0}% confidence). Sending alert in {}s unless cancelled",
            alert.accident_event.kind.display_text(),
            alert.accident_event.confidence * 100.0,
            alert.cancel_time_remaining
        );
    }

    fn show_result(&self, alert: &EmergencyAlert, success: bool) {
        if success {
            info!(
                "[notify] Emergency alert sent to {} contact(s)",
                alert.contacts_notified.len()
            );
        } else {
            warn!("[notify] Emergency alert could not be delivered");
        }
    }

    fn clear(&self) {
        info!("[notify] Cleared");
    }

    fn start_alarm(&self, sound: bool, vibrate: bool) {
        info!("[notify] Alarm on (sound: {}, vibration: {})", sound, vibrate);
    }

    fn stop_alarm(&self) {
        info!("[notify] Alarm off");
    }
}

pub struct LogWakeLock;

struct LogWakeGuard {
    held: bool,
}

impl WakeGuard for LogWakeGuard {
    fn release(&mut self) {
        if self.held {
            self.held = false;
            info!("[wake] Released");
        }
    }
}

impl Drop for LogWakeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl WakeLock for LogWakeLock {
    fn acquire(&self) -> EngineResult<Box<dyn WakeGuard>> {
        info!("[wake] Acquired");
        Ok(Box::new(LogWakeGuard { held: true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmergencyContact;

    #[tokio::test(start_paused = true)]
    async fn test_log_telephony_rings_then_hangs_up() {
        let phone = LogTelephony::new(Duration::from_secs(20));
        let mut states = phone.observe_call_state();
        assert!(phone.place_call("555").await.unwrap());
        assert_eq!(states.next().await, Some(CallState::Ringing));
        assert_eq!(states.next().await, Some(CallState::Idle));
    }

    #[test]
    fn test_profile_store_pushes_updates() {
        let store = InMemoryProfileStore::new(ProfileSnapshot::default());
        let rx = store.subscribe();
        assert!(rx.borrow().contacts.is_empty());
        store.update(ProfileSnapshot {
            contacts: vec![EmergencyContact::new("Ana", "555", "Family")],
            ..Default::default()
        });
        assert_eq!(rx.borrow().contacts.len(), 1);
    }

    #[test]
    fn test_wake_guard_releases_once() {
        let mut guard = LogWakeLock.acquire().unwrap();
        guard.release();
        guard.release();
        drop(guard);
    }
}
