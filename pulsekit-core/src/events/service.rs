//! Event producers: custom events, timed events and views

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;

use crate::config::LimitsConfig;
use crate::consent::ConsentGate;
use crate::types::Feature;

use super::event::{CustomEvent, VIEW_EVENT_KEY};
use super::queues::EventQueues;

#[derive(Default)]
struct ViewTracker {
    current: Option<(String, Instant)>,
    seen_any: bool,
}

pub struct EventService {
    consent: Arc<ConsentGate>,
    queues: Arc<EventQueues>,
    limits: LimitsConfig,
    timed: Mutex<HashMap<String, Instant>>,
    views: Mutex<ViewTracker>,
}

impl EventService {
    pub fn new(consent: Arc<ConsentGate>, queues: Arc<EventQueues>, limits: LimitsConfig) -> Self {
        Self {
            consent,
            queues,
            limits,
            timed: Mutex::new(HashMap::new()),
            views: Mutex::new(ViewTracker::default()),
        }
    }

    fn timed(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.timed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_event(&self, event: CustomEvent) -> bool {
        if event.key() == VIEW_EVENT_KEY {
            tracing::warn!("{VIEW_EVENT_KEY} is reserved, use record_view");
            return false;
        }
        if !self.consent.check_consent(Feature::Events) {
            tracing::debug!(key = event.key(), "No consent for events, ignoring");
            return false;
        }
        self.enqueue(event)
    }

    fn enqueue(&self, event: CustomEvent) -> bool {
        match event.into_event(&self.limits) {
            Some(event) => {
                self.queues.enqueue(event);
                true
            }
            None => false,
        }
    }

    /// Start timing `key`. Returns false if it is already being timed.
    pub fn start_event(&self, key: &str) -> bool {
        if !self.consent.check_consent(Feature::Events) {
            return false;
        }
        if key.trim().is_empty() {
            tracing::warn!("Ignoring timed event with empty key");
            return false;
        }
        let mut timed = self.timed();
        if timed.contains_key(key) {
            tracing::warn!(key, "Timed event already started");
            return false;
        }
        timed.insert(key.to_string(), Instant::now());
        true
    }

    /// Stop timing and record the event with its duration
    pub fn end_event(&self, event: CustomEvent) -> bool {
        let Some(started) = self.timed().remove(event.key()) else {
            tracing::warn!(key = event.key(), "Timed event was never started");
            return false;
        };
        let elapsed = started.elapsed().as_secs_f64();
        self.record_event(event.duration(elapsed))
    }

    pub fn cancel_event(&self, key: &str) -> bool {
        self.timed().remove(key).is_some()
    }

    /// Drop every running timed event. Returns how many were cancelled.
    pub fn cancel_all_timed(&self) -> usize {
        let mut timed = self.timed();
        let cancelled = timed.len();
        timed.clear();
        cancelled
    }

    pub fn timed_count(&self) -> usize {
        self.timed().len()
    }

    /// Record a view visit, closing the previous view with its duration
    pub fn record_view(&self, name: &str, segmentation: Vec<(String, Value)>) -> bool {
        if !self.consent.check_consent(Feature::Views) {
            tracing::debug!(view = name, "No consent for views, ignoring");
            return false;
        }
        if name.trim().is_empty() {
            tracing::warn!("Ignoring view with empty name");
            return false;
        }

        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((previous, started)) = views.current.take() {
            self.enqueue(Self::view_end(&previous, started));
        }

        let mut visit = CustomEvent::new(VIEW_EVENT_KEY)
            .segment("name", name)
            .segment("segment", std::env::consts::OS)
            .segment("visit", 1);
        if !views.seen_any {
            visit = visit.segment("start", 1);
        }
        for (key, value) in segmentation {
            visit = visit.segment(key, value);
        }

        views.seen_any = true;
        views.current = Some((name.to_string(), Instant::now()));
        self.enqueue(visit)
    }

    /// Close the current view, recording how long it was shown
    pub fn close_view(&self) -> bool {
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        match views.current.take() {
            Some((name, started)) if self.consent.check_consent(Feature::Views) => {
                self.enqueue(Self::view_end(&name, started))
            }
            _ => false,
        }
    }

    fn view_end(name: &str, started: Instant) -> CustomEvent {
        CustomEvent::new(VIEW_EVENT_KEY)
            .segment("name", name)
            .segment("segment", std::env::consts::OS)
            .duration(started.elapsed().as_secs_f64())
    }
}
