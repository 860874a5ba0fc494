//! Session lifecycle and the periodic extension timer

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::consent::ConsentGate;
use crate::dispatch::RequestQueue;
use crate::events::EventQueues;
use crate::location::LocationCache;
use crate::metrics::MetricsProvider;
use crate::request::Params;
use crate::types::Feature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Active { last_beat: Instant },
}

pub struct SessionCoordinator {
    state: Mutex<SessionState>,
    consent: Arc<ConsentGate>,
    queues: Arc<EventQueues>,
    requests: Arc<RequestQueue>,
    metrics: Arc<dyn MetricsProvider>,
    location: Arc<LocationCache>,
}

impl SessionCoordinator {
    pub fn new(
        consent: Arc<ConsentGate>,
        queues: Arc<EventQueues>,
        requests: Arc<RequestQueue>,
        metrics: Arc<dyn MetricsProvider>,
        location: Arc<LocationCache>,
    ) -> Self {
        Self {
            state: Mutex::new(SessionState::NotStarted),
            consent,
            queues,
            requests,
            metrics,
            location,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state(), SessionState::Active { .. })
    }

    /// Start a session. A no-op if one is already active.
    pub fn begin(&self) -> bool {
        if !self.consent.check_consent(Feature::Sessions) {
            tracing::debug!("No consent for sessions, not beginning");
            return false;
        }
        {
            let mut state = self.state();
            if let SessionState::Active { .. } = *state {
                tracing::debug!("Session already active");
                return false;
            }
            *state = SessionState::Active {
                last_beat: Instant::now(),
            };
        }

        let mut params = Params::new()
            .with("begin_session", 1)
            .with("metrics", Value::Object(self.metrics.metrics()));
        if self.consent.check_consent(Feature::Location) {
            params.extend(self.location.params());
        }
        self.requests.enqueue_request(params);
        tracing::info!("Session started");
        true
    }

    /// Report the time since the last begin or extend
    pub fn extend(&self) -> bool {
        if !self.consent.check_consent(Feature::Sessions) {
            return false;
        }
        let Some(elapsed) = self.beat(false) else {
            return false;
        };
        self.queues.flush_all();
        self.requests
            .enqueue_request(Params::new().with("session_duration", elapsed));
        true
    }

    pub fn end(&self) -> bool {
        if !self.consent.check_consent(Feature::Sessions) {
            return false;
        }
        self.finish()
    }

    /// End the session without a consent check; used once sessions consent
    /// was revoked or the device id is being replaced
    pub(crate) fn finish(&self) -> bool {
        let Some(elapsed) = self.beat(true) else {
            return false;
        };
        self.queues.flush_all();
        self.requests.enqueue_request(
            Params::new()
                .with("end_session", 1)
                .with("session_duration", elapsed),
        );
        tracing::info!("Session ended");
        true
    }

    /// Whole seconds since the last beat; resets the beat or ends the session
    fn beat(&self, end: bool) -> Option<u64> {
        let mut state = self.state();
        let SessionState::Active { last_beat } = *state else {
            return None;
        };
        let now = Instant::now();
        *state = if end {
            SessionState::NotStarted
        } else {
            SessionState::Active { last_beat: now }
        };
        Some(now.duration_since(last_beat).as_secs_f64().round() as u64)
    }
}

/// Cancellable periodic task driving automatic session extension
#[derive(Default)]
pub struct SessionTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTimer {
    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `tick` every `period`, replacing any running timer
    pub fn start<F>(&self, runtime: &Handle, period: Duration, tick: F)
    where
        F: Fn() + Send + 'static,
    {
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                tick();
            }
        });
        if let Some(previous) = self.handle().replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) -> bool {
        match self.handle().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle().as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsentConfig, LocationConfig};
    use crate::metrics::StaticMetrics;
    use crate::test_support::{request_queue, RecordingTransport};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(required: bool) -> (SessionCoordinator, Arc<RequestQueue>, Arc<ConsentGate>) {
        let requests = request_queue(Arc::new(RecordingTransport::default()), 10);
        let consent = Arc::new(ConsentGate::new(
            &ConsentConfig {
                required,
                ..Default::default()
            },
            requests.clone(),
        ));
        let queues = Arc::new(EventQueues::new(100, requests.clone()));
        let location = Arc::new(LocationCache::from_config(&LocationConfig {
            city: Some("Oslo".into()),
            ..Default::default()
        }));
        let session = SessionCoordinator::new(
            consent.clone(),
            queues,
            requests.clone(),
            Arc::new(StaticMetrics::from_config(&BTreeMap::new())),
            location,
        );
        (session, requests, consent)
    }

    fn urls(requests: &RequestQueue) -> Vec<String> {
        requests
            .store()
            .models()
            .unwrap()
            .into_iter()
            .map(|r| r.url.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_begin_extend_end() {
        let (session, requests, _) = coordinator(false);

        assert!(!session.extend());
        assert!(!session.end());

        assert!(session.begin());
        assert!(!session.begin());
        assert!(session.is_active());
        assert!(session.extend());
        assert!(session.end());
        assert!(!session.is_active());

        let urls = urls(&requests);
        assert_eq!(urls.len(), 3);
        assert!(urls[0].contains("begin_session=1"));
        assert!(urls[0].contains("metrics=%7B%22_os%22"));
        assert!(urls[0].contains("city=Oslo"));
        assert!(urls[1].contains("session_duration=0"));
        assert!(urls[2].contains("end_session=1"));
    }

    #[tokio::test]
    async fn test_sessions_need_consent() {
        let (session, requests, consent) = coordinator(true);
        assert!(!session.begin());

        consent.give_consent(&[Feature::Sessions]);
        assert!(session.begin());

        let urls = urls(&requests);
        assert!(urls.last().unwrap().contains("begin_session=1"));
        // location consent missing
        assert!(!urls.last().unwrap().contains("city="));
    }

    #[tokio::test]
    async fn test_finish_ignores_consent() {
        let (session, _, consent) = coordinator(true);
        consent.give_consent(&[Feature::Sessions]);
        assert!(session.begin());
        consent.remove_consent(&[Feature::Sessions]);

        assert!(!session.end());
        assert!(session.finish());
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_until_stopped() {
        let timer = SessionTimer::default();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        timer.start(&Handle::current(), Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        assert!(timer.stop());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!timer.stop());
    }
}
