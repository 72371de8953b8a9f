//! Emergency alert state machine.
//!
//! ```text
//! PENDING ──cancel──▶ CANCELLED
//!    │
//!    └──countdown 0 / confirm──▶ CONFIRMED ──fan-out──▶ SENT | FAILED
//! ```
//!
//! `AlertManager` is the only writer of alert status. All state lives behind
//! one mutex which is never held across an await. Countdown, disposal,
//! fan-out and escalation run as separate tasks and are aborted through
//! their `JoinHandle`s.

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use super::escalation::{CallEscalator, EscalationHandle, EscalationOutcome};
use super::message::build_emergency_message;
use crate::api::models::EmergencyAlertRequest;
use crate::api::submission::SubmissionService;
use crate::config::AlertConfig;
use crate::error::{EngineError, EngineResult};
use crate::platform::{
    emergency_location, LocationProvider, MessagingGateway, NotificationChannel, ProfileStore,
    TelephonyGateway,
};
use crate::types::{
    AccidentEvent, AlertSettings, AlertStatus, EmergencyAlert, EmergencyContact,
};

/// External collaborators of the alert manager.
#[derive(Clone)]
pub struct AlertDeps {
    pub location: Arc<dyn LocationProvider>,
    pub messaging: Arc<dyn MessagingGateway>,
    pub telephony: Arc<dyn TelephonyGateway>,
    pub notifications: Arc<dyn NotificationChannel>,
    pub profile: Arc<dyn ProfileStore>,
    /// Remote reporting; `None` runs local channels only
    pub submission: Option<Arc<SubmissionService>>,
}

#[derive(Default)]
struct AlertState {
    current: Option<EmergencyAlert>,
    settings: AlertSettings,
    contacts: Vec<EmergencyContact>,
    countdown: Option<JoinHandle<()>>,
    dispose: Option<JoinHandle<()>>,
    fanout: Option<JoinHandle<()>>,
    /// Running escalation and the alert it belongs to. It outlives the
    /// fan-out, so a later alert may be current while it still dials.
    escalation: Option<(String, EscalationHandle)>,
}

impl AlertState {
    fn is_current(&self, id: &str) -> bool {
        self.current.as_ref().map(|a| a.id == id).unwrap_or(false)
    }

    fn pending(&self) -> Option<&EmergencyAlert> {
        self.current
            .as_ref()
            .filter(|a| a.status == AlertStatus::Pending)
    }

    /// The alert that keeps a new trigger out: pending, or confirmed with
    /// its fan-out still running.
    fn unresolved(&self) -> Option<&EmergencyAlert> {
        self.current
            .as_ref()
            .filter(|a| matches!(a.status, AlertStatus::Pending | AlertStatus::Confirmed))
    }

    fn take_escalation_of(&mut self, id: &str) -> Option<EscalationHandle> {
        match &self.escalation {
            Some((owner, _)) if owner == id => self.escalation.take().map(|(_, h)| h),
            _ => None,
        }
    }
}

struct Inner {
    config: AlertConfig,
    deps: AlertDeps,
    profile: watch::Receiver<crate::types::ProfileSnapshot>,
    state: Mutex<AlertState>,
    updates: watch::Sender<Option<EmergencyAlert>>,
}

#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<Inner>,
}

/// Channel results of one fan-out
#[derive(Debug, Default)]
struct FanoutResult {
    remote_alert_id: Option<String>,
    sms_delivered: Vec<String>,
    call_initiated: bool,
}

impl AlertManager {
    pub fn new(config: AlertConfig, deps: AlertDeps) -> Self {
        let profile = deps.profile.subscribe();
        let (updates, _) = watch::channel(None);
        AlertManager {
            inner: Arc::new(Inner {
                config,
                deps,
                profile,
                state: Mutex::new(AlertState::default()),
                updates,
            }),
        }
    }

    /// Observe every alert change. `None` once the alert is disposed.
    pub fn subscribe(&self) -> watch::Receiver<Option<EmergencyAlert>> {
        self.inner.updates.subscribe()
    }

    pub fn current(&self) -> Option<EmergencyAlert> {
        self.inner.lock().ok().and_then(|s| s.current.clone())
    }

    pub fn has_pending_alert(&self) -> bool {
        self.inner
            .lock()
            .map(|s| s.pending().is_some())
            .unwrap_or(false)
    }

    /// Calls still queued in the running escalation
    pub fn pending_calls(&self) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.escalation.as_ref().map(|(_, e)| e.pending_calls()))
            .unwrap_or(0)
    }

    /// Start the cancel countdown for `event`. Returns the new alert id, or
    /// `None` when an alert is still pending or confirmed and notifying.
    pub async fn trigger(&self, event: AccidentEvent) -> EngineResult<Option<String>> {
        if let Some(active) = self.inner.lock()?.unresolved() {
            info!(
                "[alert] Alert {} still {:?}, ignoring {:?}",
                active.id, active.status, event.kind
            );
            return Ok(None);
        }

        let location =
            emergency_location(self.inner.deps.location.as_ref(), &self.inner.config).await;
        let profile = self.inner.profile.borrow().clone();
        let settings = profile.settings.clone();
        let contacts = profile.active_contacts();

        let mut alert = EmergencyAlert::new(
            event,
            location,
            profile.medical.clone(),
            settings.cancel_timeout_seconds,
        );

        let mut state = self.inner.lock()?;
        // a concurrent trigger may have won while the location was resolving
        if state.unresolved().is_some() {
            return Ok(None);
        }
        if let Some(handle) = state.dispose.take() {
            handle.abort();
        }
        // ids are millisecond stamps; keep them unique across quick re-triggers
        if state.current.as_ref().map(|a| a.id == alert.id).unwrap_or(false) {
            alert.id.push_str("_1");
        }

        warn!(
            "[alert] {} detected ({:.0}% confidence); alert {} pending, {}s to cancel",
            alert.accident_event.kind.display_text(),
            alert.accident_event.confidence * 100.0,
            alert.id,
            alert.cancel_time_remaining
        );

        let id = alert.id.clone();
        self.inner.deps.notifications.show_pending(&alert);
        self.inner
            .deps
            .notifications
            .start_alarm(settings.alert_sound, settings.vibration);

        state.current = Some(alert);
        state.settings = settings;
        state.contacts = contacts;
        state.countdown = Some(self.spawn_countdown(id.clone()));
        self.inner.publish(&state);
        Ok(Some(id))
    }

    fn spawn_countdown(&self, id: String) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let remaining = match manager.inner.lock() {
                    Ok(state) => match state.pending() {
                        Some(a) if a.id == id => a.cancel_time_remaining,
                        _ => return,
                    },
                    Err(_) => return,
                };
                if remaining == 0 {
                    break;
                }
                sleep(Duration::from_secs(1)).await;

                let Ok(mut state) = manager.inner.lock() else {
                    return;
                };
                if !state.is_current(&id) {
                    return;
                }
                if let Some(alert) = state.current.as_mut() {
                    alert.cancel_time_remaining = alert.cancel_time_remaining.saturating_sub(1);
                }
                manager.inner.publish(&state);
            }
            info!("[alert] Countdown expired for {}", id);
            if let Err(e) = manager.confirm_alert(&id) {
                error!("[alert] Failed to confirm {}: {}", id, e);
            }
        })
    }

    /// User cancelled. Only a pending alert can be cancelled.
    pub fn cancel(&self) -> EngineResult<bool> {
        let mut state = self.inner.lock()?;
        let Some(id) = state.pending().map(|a| a.id.clone()) else {
            debug!("[alert] Nothing to cancel");
            return Ok(false);
        };

        if let Some(handle) = state.countdown.take() {
            handle.abort();
        }
        // an earlier alert's escalation keeps dialing
        if let Some(escalation) = state.take_escalation_of(&id) {
            escalation.cancel();
        }
        self.inner.deps.notifications.stop_alarm();
        self.inner.deps.notifications.clear();

        if let Some(alert) = state.current.as_mut() {
            alert.status = AlertStatus::Cancelled;
        }
        info!("[alert] Alert {} cancelled by user", id);
        state.dispose = Some(self.spawn_dispose(id));
        self.inner.publish(&state);
        Ok(true)
    }

    /// Confirm the pending alert now instead of waiting for the countdown.
    pub fn confirm(&self) -> EngineResult<bool> {
        let id = match self.inner.lock()?.pending() {
            Some(a) => a.id.clone(),
            None => return Ok(false),
        };
        self.confirm_alert(&id)
    }

    fn confirm_alert(&self, id: &str) -> EngineResult<bool> {
        let mut state = self.inner.lock()?;
        match state.pending() {
            Some(a) if a.id == id => {}
            _ => return Ok(false),
        }

        if let Some(handle) = state.countdown.take() {
            handle.abort();
        }
        self.inner.deps.notifications.stop_alarm();

        let alert = match state.current.as_mut() {
            Some(alert) => {
                alert.status = AlertStatus::Confirmed;
                alert.cancel_time_remaining = 0;
                alert.clone()
            }
            None => return Ok(false),
        };
        info!("[alert] Alert {} confirmed, notifying contacts", id);

        let settings = state.settings.clone();
        let contacts = state.contacts.clone();
        let manager = self.clone();
        state.fanout = Some(tokio::spawn(async move {
            manager.fan_out(alert, settings, contacts).await;
        }));
        self.inner.publish(&state);
        Ok(true)
    }

    /// Submission, SMS and call escalation in parallel, then the final status.
    async fn fan_out(
        &self,
        alert: EmergencyAlert,
        settings: AlertSettings,
        contacts: Vec<EmergencyContact>,
    ) {
        let message = build_emergency_message(&alert, &settings);
        let (remote_alert_id, sms_delivered, call_initiated) = tokio::join!(
            self.submit_remote(&alert, &settings, &contacts),
            self.send_messages(&message, &settings, &contacts),
            self.escalate_calls(&alert.id, &settings, &contacts),
        );
        let result = FanoutResult {
            remote_alert_id,
            sms_delivered,
            call_initiated,
        };

        let success = !result.sms_delivered.is_empty() || result.call_initiated;
        let status = if success {
            AlertStatus::Sent
        } else {
            AlertStatus::Failed
        };

        {
            let Ok(mut state) = self.inner.lock() else {
                error!("[alert] State unavailable, dropping result for {}", alert.id);
                return;
            };
            if !state.is_current(&alert.id) {
                debug!("[alert] Alert {} superseded before fan-out finished", alert.id);
            } else if let Some(current) = state.current.as_mut() {
                current.status = status;
                current.contacts_notified = result.sms_delivered.clone();
                current.remote_alert_id = result.remote_alert_id.clone();
                self.inner.deps.notifications.show_result(current, success);
                state.dispose = Some(self.spawn_dispose(alert.id.clone()));
                self.inner.publish(&state);
            }
        }

        info!(
            "[alert] Alert {} {:?}: {} SMS delivered, call initiated: {}",
            alert.id,
            status,
            result.sms_delivered.len(),
            result.call_initiated
        );

        if let (Some(remote_id), Some(submission)) =
            (&result.remote_alert_id, &self.inner.deps.submission)
        {
            let remote_status = if success { "COMPLETED" } else { "FAILED" };
            if let Err(e) = submission.update_alert_status(remote_id, remote_status).await {
                warn!("[api] Status update for {} failed: {}", remote_id, e);
            }
        }
    }

    async fn submit_remote(
        &self,
        alert: &EmergencyAlert,
        settings: &AlertSettings,
        contacts: &[EmergencyContact],
    ) -> Option<String> {
        let submission = self.inner.deps.submission.as_ref()?;
        let api = submission.config();

        let mut payload = alert.clone();
        if !settings.include_medical_info {
            payload.medical_info = None;
        }
        let request = EmergencyAlertRequest::from_alert(
            &payload,
            contacts,
            &api.device_id,
            api.user_id.as_deref(),
            &api.api_key,
        );

        match submission.submit_alert(&request).await {
            Ok(response) => Some(response.alert_id),
            Err(EngineError::InvalidParameters(reason)) => {
                warn!("[api] Alert not submitted, invalid parameters: {}", reason);
                None
            }
            Err(e) => {
                warn!("[api] Alert submission failed: {}", e);
                None
            }
        }
    }

    /// SMS every contact in order. Returns the names of contacts reached.
    async fn send_messages(
        &self,
        message: &str,
        settings: &AlertSettings,
        contacts: &[EmergencyContact],
    ) -> Vec<String> {
        let mut delivered = Vec::new();
        if !settings.send_sms {
            return delivered;
        }

        for (i, contact) in contacts.iter().enumerate() {
            if i > 0 {
                sleep(self.inner.config.sms_gap).await;
            }
            match self.inner.deps.messaging.send(&contact.phone, message).await {
                Ok(true) => {
                    info!("[sms] Delivered to {}", contact.name);
                    delivered.push(contact.name.clone());
                }
                Ok(false) => warn!("[sms] Delivery to {} failed", contact.name),
                Err(EngineError::PermissionDenied(what)) => {
                    warn!("[sms] Permission denied ({}), skipping SMS", what);
                    break;
                }
                Err(e) => warn!("[sms] Sending to {} failed: {}", contact.name, e),
            }
        }
        delivered
    }

    /// Start escalation and wait for the first initiated call.
    async fn escalate_calls(
        &self,
        alert_id: &str,
        settings: &AlertSettings,
        contacts: &[EmergencyContact],
    ) -> bool {
        if !settings.make_call || contacts.is_empty() {
            return false;
        }

        let outcome = {
            let Ok(mut state) = self.inner.lock() else {
                return false;
            };
            if !state.is_current(alert_id) {
                return false;
            }
            // one active call at a time: a newer confirmed alert takes over the line
            if let Some((previous, handle)) = state.escalation.take() {
                info!("[call] Escalation for {} superseded by {}", previous, alert_id);
                handle.cancel();
            }
            let numbers = contacts.iter().map(|c| c.phone.clone()).collect();
            let mut handle =
                CallEscalator::new(Arc::clone(&self.inner.deps.telephony), self.inner.config.clone())
                    .spawn(numbers);
            let outcome = handle.take_outcome();
            state.escalation = Some((alert_id.to_string(), handle));
            outcome
        };

        match outcome {
            Some(rx) => matches!(rx.await, Ok(EscalationOutcome::Initiated(_))),
            None => false,
        }
    }

    /// Clear `id` after the grace period if it is still the current, finished alert.
    fn spawn_dispose(&self, id: String) -> JoinHandle<()> {
        let manager = self.clone();
        let grace = self.inner.config.dispose_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            let Ok(mut state) = manager.inner.lock() else {
                return;
            };
            let finished = state
                .current
                .as_ref()
                .map(|a| a.id == id && a.status.is_terminal())
                .unwrap_or(false);
            if finished {
                debug!("[alert] Disposing alert {}", id);
                state.current = None;
                state.dispose = None;
                manager.inner.publish(&state);
            }
        })
    }

    /// Abort every alert timer and the running escalation.
    pub fn shutdown(&self) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        for handle in [state.countdown.take(), state.dispose.take(), state.fanout.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        if let Some((_, escalation)) = state.escalation.take() {
            escalation.cancel();
        }
        if state.pending().is_some() {
            self.inner.deps.notifications.stop_alarm();
        }
        info!("[alert] Alert manager shut down");
    }
}

impl Inner {
    fn lock(&self) -> EngineResult<MutexGuard<'_, AlertState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::lock_poisoned("alert state"))
    }

    fn publish(&self, state: &AlertState) {
        self.updates.send_replace(state.current.clone());
    }
}
