//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::{Config, ServerConfig};
use crate::db::{MigrationContext, RequestStore};
use crate::device::DeviceIdentity;
use crate::dispatch::{DispatchPolicy, Dispatcher, RequestQueue, SendFuture, Transport};
use crate::error::Error;
use crate::request::{Request, RequestBuilder};
use crate::types::DeviceId;

/// Transport that records every attempt and can be told to fail
#[derive(Default)]
pub struct RecordingTransport {
    delay: Duration,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    response: Mutex<Option<String>>,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Body returned by successful sends
    pub fn respond_with(&self, body: &str) {
        *self.response.lock().unwrap() = Some(body.to_string());
    }

    /// Payload of every attempt, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    /// Payload of every successful send, in order
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send<'a>(&'a self, request: &'a Request) -> SendFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.attempts
                .lock()
                .unwrap()
                .push(request.data().to_string());

            let forced = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced || self.fail_all.load(Ordering::SeqCst) {
                return Err(Error::Transport("injected failure".to_string()));
            }

            self.delivered
                .lock()
                .unwrap()
                .push(request.data().to_string());
            let response = self.response.lock().unwrap().clone();
            Ok(response.unwrap_or_else(|| r#"{"result":"Success"}"#.to_string()))
        })
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        url: Some("https://collect.example.com".to_string()),
        app_key: Some("APPKEY".to_string()),
        device_id: Some("test-device".to_string()),
        ..Default::default()
    }
}

/// Config with fast retries and no pacing
pub fn test_config() -> Config {
    let mut config = Config {
        server: server_config(),
        ..Default::default()
    };
    config.queue.retry_backoff_ms = 0;
    config.queue.request_pacing_ms = 0;
    config.session.automatic_tracking = false;
    config
}

pub fn memory_store(limit: usize) -> Arc<RequestStore> {
    let store = RequestStore::open_in_memory(limit).unwrap();
    store.migrate(&MigrationContext::default()).unwrap();
    Arc::new(store)
}

/// Request queue over an in-memory store, delivering on the current runtime
pub fn request_queue(transport: Arc<RecordingTransport>, limit: usize) -> Arc<RequestQueue> {
    let store = memory_store(limit);
    let identity = Arc::new(DeviceIdentity::new(DeviceId::developer("test-device")));
    let builder = RequestBuilder::new(&server_config(), identity).unwrap();
    let dispatcher = Dispatcher::new(
        store.clone(),
        transport,
        DispatchPolicy::from(&test_config().queue),
        Handle::current(),
    );
    Arc::new(RequestQueue::new(builder, store, dispatcher))
}

/// Clear the url of the oldest request so it no longer decodes
pub fn corrupt_head(store: &RequestStore) {
    store
        .execute_raw("UPDATE requests SET url = NULL WHERE id = (SELECT MIN(id) FROM requests)")
        .unwrap();
}
