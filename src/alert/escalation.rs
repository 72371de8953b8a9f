//! Sequential voice-call escalation.
//!
//! Contacts are dialed one at a time. Each call gets its own call-state
//! observer which is dropped when the call ends, so there is never more than
//! one active call or one live observer.

use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::AlertConfig;
use crate::error::EngineError;
use crate::platform::{CallState, TelephonyGateway};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// First number whose call was initiated
    Initiated(String),
    /// Queue ran out without a single initiated call
    Exhausted,
}

#[derive(Debug, PartialEq, Eq)]
enum CallEnd {
    HungUp,
    TimedOut,
}

/// Running escalation. Aborting it tears down the current call observer.
pub struct EscalationHandle {
    task: JoinHandle<()>,
    queue: Arc<Mutex<VecDeque<String>>>,
    outcome: Option<oneshot::Receiver<EscalationOutcome>>,
}

impl EscalationHandle {
    /// Numbers not yet dialed
    pub fn pending_calls(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Resolves with the first initiation, or `Exhausted`. Only the first caller gets it.
    pub fn take_outcome(&mut self) -> Option<oneshot::Receiver<EscalationOutcome>> {
        self.outcome.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop dialing and drop the queue.
    pub fn cancel(&self) {
        if let Ok(mut q) = self.queue.lock() {
            q.clear();
        }
        self.task.abort();
    }
}

pub struct CallEscalator {
    telephony: Arc<dyn TelephonyGateway>,
    config: AlertConfig,
}

impl CallEscalator {
    pub fn new(telephony: Arc<dyn TelephonyGateway>, config: AlertConfig) -> Self {
        CallEscalator { telephony, config }
    }

    pub fn spawn(self, numbers: Vec<String>) -> EscalationHandle {
        let queue = Arc::new(Mutex::new(numbers.into_iter().collect::<VecDeque<_>>()));
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(self.run(Arc::clone(&queue), tx));
        EscalationHandle {
            task,
            queue,
            outcome: Some(rx),
        }
    }

    async fn run(self, queue: Arc<Mutex<VecDeque<String>>>, tx: oneshot::Sender<EscalationOutcome>) {
        let mut report = Some(tx);

        loop {
            let next = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => None,
            };
            let Some(number) = next else {
                break;
            };

            // Register before dialing so no transition is missed
            let mut states = self.telephony.observe_call_state();
            info!("[call] Calling {}", number);

            match self.telephony.place_call(&number).await {
                Ok(true) => {
                    if let Some(tx) = report.take() {
                        let _ = tx.send(EscalationOutcome::Initiated(number.clone()));
                    }
                    let end = self.await_call_end(&mut states).await;
                    drop(states);
                    match end {
                        CallEnd::HungUp => debug!("[call] Call to {} ended", number),
                        CallEnd::TimedOut => warn!("[call] Call to {} timed out, moving on", number),
                    }
                    sleep(self.config.inter_call_delay).await;
                }
                Ok(false) => {
                    drop(states);
                    warn!("[call] Could not initiate call to {}", number);
                    sleep(self.config.failed_call_delay).await;
                }
                Err(EngineError::PermissionDenied(what)) => {
                    warn!("[call] Permission denied ({}), abandoning escalation", what);
                    if let Ok(mut q) = queue.lock() {
                        q.clear();
                    }
                    break;
                }
                Err(e) => {
                    drop(states);
                    warn!("[call] Call to {} failed: {}", number, e);
                    sleep(self.config.failed_call_delay).await;
                }
            }
        }

        info!("[call] Escalation finished");
        if let Some(tx) = report.take() {
            let _ = tx.send(EscalationOutcome::Exhausted);
        }
    }

    /// Wait for IDLE. The timeout is armed until the call goes off-hook.
    async fn await_call_end(
        &self,
        states: &mut futures::stream::BoxStream<'static, CallState>,
    ) -> CallEnd {
        let mut deadline = Some(Instant::now() + self.config.call_timeout);
        loop {
            let state = match deadline {
                Some(at) => {
                    tokio::select! {
                        s = states.next() => s,
                        _ = sleep_until(at) => return CallEnd::TimedOut,
                    }
                }
                None => states.next().await,
            };
            match state {
                Some(CallState::Active) => {
                    debug!("[call] Off-hook, timeout disarmed");
                    deadline = None;
                }
                Some(CallState::Ringing) => debug!("[call] Ringing"),
                Some(CallState::Idle) | None => return CallEnd::HungUp,
            }
        }
    }
}
