//! Request dispatch engine
//!
//! Drains the request store head by head through a [`Transport`]. At most
//! one drain runs at a time: the Idle to Draining transition happens inside
//! the state channel's write lock, so concurrent triggers collapse into the
//! running activation.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::{QueueConfig, RetryExhaustion};
use crate::db::RequestStore;
use crate::error::{Error, Result};
use crate::request::StoredRequest;

use super::transport::Transport;

/// Whether a drain activation is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
}

/// Retry and pacing settings for the drain loop
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Total attempts per request, at least 1
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub request_pacing: Duration,
    pub on_exhausted: RetryExhaustion,
    /// Triggers are ignored; only [`Dispatcher::drain`] delivers
    pub manual: bool,
}

impl From<&QueueConfig> for DispatchPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            request_pacing: config.request_pacing(),
            on_exhausted: config.on_retry_exhausted,
            manual: config.manual_dispatch,
        }
    }
}

/// Outcome of one drain activation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub dropped: usize,
    /// Stopped with a failed request kept at the head
    pub halted: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Emptied,
    Halted,
    StoreFailed,
}

pub struct Dispatcher {
    store: Arc<RequestStore>,
    transport: Arc<dyn Transport>,
    policy: DispatchPolicy,
    state: watch::Sender<DrainState>,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RequestStore>,
        transport: Arc<dyn Transport>,
        policy: DispatchPolicy,
        runtime: Handle,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(DrainState::Idle);
        Arc::new(Self {
            store,
            transport,
            policy,
            state,
            runtime,
        })
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    /// Start a background drain unless one is already running
    pub fn process_queue(self: &Arc<Self>) {
        if self.policy.manual {
            tracing::trace!("Manual dispatch, ignoring drain trigger");
            return;
        }
        if !self.try_acquire() {
            return;
        }

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let report = this.run().await;
            if report.sent > 0 || report.dropped > 0 || report.halted {
                tracing::info!(
                    sent = report.sent,
                    dropped = report.dropped,
                    halted = report.halted,
                    "Drain finished"
                );
            }
        });
    }

    /// Run one drain inline. Returns `None` if a drain was already running.
    pub async fn drain(&self) -> Option<DrainReport> {
        if !self.try_acquire() {
            return None;
        }
        Some(self.run().await)
    }

    /// Resolve once no drain is running
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == DrainState::Idle).await;
    }

    fn try_acquire(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == DrainState::Idle {
                *state = DrainState::Draining;
                true
            } else {
                false
            }
        })
    }

    async fn run(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let outcome = self.drain_until_empty(&mut report).await;
            self.state.send_replace(DrainState::Idle);
            if outcome != Outcome::Emptied {
                break;
            }
            // a producer may have enqueued after the last empty peek
            match self.store.count() {
                Ok(n) if n > 0 && self.try_acquire() => continue,
                _ => break,
            }
        }
        report
    }

    async fn drain_until_empty(&self, report: &mut DrainReport) -> Outcome {
        let mut first = true;
        loop {
            let head = match self.store.peek() {
                Ok(Some(head)) => head,
                Ok(None) => return Outcome::Emptied,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read request store");
                    return Outcome::StoreFailed;
                }
            };

            let stored = match head.decode() {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(id = head.id, error = %e, "Dropping malformed request");
                    if !self.remove(head.id) {
                        return Outcome::StoreFailed;
                    }
                    report.dropped += 1;
                    continue;
                }
            };

            if !first && !self.policy.request_pacing.is_zero() {
                tokio::time::sleep(self.policy.request_pacing).await;
            }
            first = false;

            match self.send_with_retry(&stored).await {
                Ok(()) => report.sent += 1,
                Err(e) => match self.policy.on_exhausted {
                    RetryExhaustion::Drop => {
                        tracing::warn!(id = stored.id, error = %e, "Retries exhausted, dropping request");
                        report.dropped += 1;
                    }
                    RetryExhaustion::Halt => {
                        tracing::warn!(id = stored.id, error = %e, "Retries exhausted, halting until next trigger");
                        report.halted = true;
                        return Outcome::Halted;
                    }
                },
            }

            if !self.remove(stored.id) {
                return Outcome::StoreFailed;
            }
        }
    }

    async fn send_with_retry(&self, stored: &StoredRequest) -> Result<()> {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.send(&stored.request).await {
                Ok(_) => {
                    tracing::debug!(id = stored.id, attempt, "Request delivered");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(id = stored.id, attempt, attempts, error = %e, "Delivery attempt failed");
                    last_error = Some(e);
                    if attempt < attempts && !self.policy.retry_backoff.is_zero() {
                        tokio::time::sleep(self.policy.retry_backoff).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Transport("no delivery attempt made".to_string())))
    }

    fn remove(&self, id: i64) -> bool {
        match self.store.remove(id) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(id, error = %e, "Failed to remove request from store");
                false
            }
        }
    }
}
