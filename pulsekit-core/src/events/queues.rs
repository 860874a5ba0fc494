//! Event batching queues
//!
//! Views and other events are buffered separately. A queue reaching the
//! threshold is flushed into one `events` request. Each queue has a flush
//! guard: threshold flushes skip when it is busy, forced flushes wait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use serde_json::Value;

use crate::dispatch::RequestQueue;
use crate::request::Params;

use super::event::Event;

/// Which batching queue an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    View,
    Other,
}

#[derive(Default)]
struct EventQueue {
    events: Mutex<Vec<Event>>,
    flush_guard: Mutex<()>,
}

impl EventQueue {
    fn events(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_flush(&self) -> MutexGuard<'_, ()> {
        self.flush_guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_flush(&self) -> Option<MutexGuard<'_, ()>> {
        match self.flush_guard.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events())
    }
}

pub struct EventQueues {
    views: EventQueue,
    others: EventQueue,
    threshold: usize,
    requests: Arc<RequestQueue>,
}

impl EventQueues {
    pub fn new(threshold: usize, requests: Arc<RequestQueue>) -> Self {
        Self {
            views: EventQueue::default(),
            others: EventQueue::default(),
            threshold: threshold.max(1),
            requests,
        }
    }

    fn queue(&self, category: EventCategory) -> &EventQueue {
        match category {
            EventCategory::View => &self.views,
            EventCategory::Other => &self.others,
        }
    }

    /// Buffer an event, flushing its queue once the threshold is reached
    pub fn enqueue(&self, event: Event) {
        let category = if event.is_view() {
            EventCategory::View
        } else {
            EventCategory::Other
        };
        let queue = self.queue(category);

        let len = {
            let mut events = queue.events();
            events.push(event);
            events.len()
        };

        if len >= self.threshold {
            match queue.try_lock_flush() {
                Some(_guard) => self.send(queue.take()),
                None => tracing::debug!(?category, "Flush already running, skipping threshold flush"),
            }
        }
    }

    /// Flush one queue, waiting for a running flush of it to finish
    pub fn flush(&self, category: EventCategory) {
        let queue = self.queue(category);
        let _guard = queue.lock_flush();
        self.send(queue.take());
    }

    /// Flush both queues into a single request, other events first
    pub fn flush_all(&self) {
        let _others_guard = self.others.lock_flush();
        let _views_guard = self.views.lock_flush();

        let mut events = self.others.take();
        events.extend(self.views.take());
        self.send(events);
    }

    pub fn len(&self, category: EventCategory) -> usize {
        self.queue(category).events().len()
    }

    pub fn total(&self) -> usize {
        self.len(EventCategory::View) + self.len(EventCategory::Other)
    }

    /// Drop buffered events without sending them
    pub fn clear(&self) {
        self.views.take();
        self.others.take();
    }

    fn send(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        let batch = Value::Array(events.iter().map(Event::to_json).collect());
        if self
            .requests
            .enqueue_request(Params::new().with("events", batch))
            .is_some()
        {
            tracing::debug!(count, "Flushed events");
        }
    }
}
