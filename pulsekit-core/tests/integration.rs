//! Integration tests for the request pipeline
//!
//! These drive the public API end to end: producers and event queues feed
//! the durable store, and the dispatcher drains it through a mock transport.

use pulsekit_core::config::{Config, RetryExhaustion, ServerConfig};
use pulsekit_core::db::{MigrationContext, RequestStore};
use pulsekit_core::device::DeviceIdentity;
use pulsekit_core::dispatch::{DispatchPolicy, Dispatcher, RequestQueue, SendFuture, Transport};
use pulsekit_core::request::{Params, Request, RequestBuilder, RequestRecord};
use pulsekit_core::{Analytics, CustomEvent, DeviceId, Error, Feature};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;

/// Transport recording what it was asked to send
#[derive(Default)]
struct MockTransport {
    delay: Duration,
    fail_all: AtomicBool,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
}

impl MockTransport {
    fn failing() -> Self {
        let transport = Self::default();
        transport.fail_all.store(true, Ordering::SeqCst);
        transport
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send<'a>(&'a self, request: &'a Request) -> SendFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.attempts.lock().unwrap().push(request.data().to_string());
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(Error::Transport("connection refused".to_string()));
            }
            self.delivered.lock().unwrap().push(request.data().to_string());
            Ok(String::new())
        })
    }
}

fn server() -> ServerConfig {
    ServerConfig {
        url: Some("https://collect.example.com".to_string()),
        app_key: Some("APPKEY".to_string()),
        device_id: Some("device-1".to_string()),
        ..Default::default()
    }
}

fn config() -> Config {
    let mut config = Config {
        server: server(),
        ..Default::default()
    };
    config.queue.retry_backoff_ms = 0;
    config.queue.request_pacing_ms = 0;
    config.queue.manual_dispatch = true;
    config.session.automatic_tracking = false;
    config
}

fn policy(max_retries: u32, on_exhausted: RetryExhaustion) -> DispatchPolicy {
    DispatchPolicy {
        max_retries,
        retry_backoff: Duration::ZERO,
        request_pacing: Duration::ZERO,
        on_exhausted,
        manual: false,
    }
}

fn memory_store(limit: usize) -> Arc<RequestStore> {
    let store = RequestStore::open_in_memory(limit).unwrap();
    store.migrate(&MigrationContext::default()).unwrap();
    Arc::new(store)
}

fn queue(
    store: Arc<RequestStore>,
    transport: Arc<MockTransport>,
    policy: DispatchPolicy,
) -> RequestQueue {
    let identity = Arc::new(DeviceIdentity::new(DeviceId::developer("device-1")));
    let builder = RequestBuilder::new(&server(), identity).unwrap();
    let dispatcher = Dispatcher::new(store.clone(), transport, policy, Handle::current());
    RequestQueue::new(builder, store, dispatcher)
}

/// Value of `key` in a delivered GET target
fn query_value(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?').map(|(_, q)| q)?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| urlencoding::decode(v).unwrap().into_owned())
    })
}

fn seqs(urls: &[String]) -> Vec<String> {
    urls.iter()
        .map(|u| query_value(u, "seq").unwrap())
        .collect()
}

// ============================================
// Delivery order and capacity
// ============================================

#[tokio::test]
async fn test_fifo_delivery() {
    let transport = Arc::new(MockTransport::default());
    let queue = queue(memory_store(100), transport.clone(), policy(3, RetryExhaustion::Drop));

    for i in 0..10 {
        queue.enqueue_request(Params::new().with("seq", i));
    }
    queue.dispatcher().wait_idle().await;

    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(seqs(&transport.delivered()), expected);
    assert_eq!(queue.store().count().unwrap(), 0);
}

#[tokio::test]
async fn test_overflow_drops_oldest() {
    let transport = Arc::new(MockTransport::default());
    let store = memory_store(3);
    let dispatcher = Dispatcher::new(
        store.clone(),
        transport.clone(),
        DispatchPolicy {
            manual: true,
            ..policy(3, RetryExhaustion::Drop)
        },
        Handle::current(),
    );
    let identity = Arc::new(DeviceIdentity::new(DeviceId::developer("device-1")));
    let queue = RequestQueue::new(
        RequestBuilder::new(&server(), identity).unwrap(),
        store.clone(),
        dispatcher.clone(),
    );

    for i in 0..4 {
        queue.enqueue_request(Params::new().with("seq", i));
    }
    assert_eq!(store.count().unwrap(), 3);

    let report = dispatcher.drain().await.unwrap();
    assert_eq!(report.sent, 3);
    assert_eq!(seqs(&transport.delivered()), vec!["1", "2", "3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_send_each_request_once() {
    let transport = Arc::new(MockTransport {
        delay: Duration::from_millis(2),
        ..Default::default()
    });
    let queue = Arc::new(queue(
        memory_store(100),
        transport.clone(),
        policy(3, RetryExhaustion::Drop),
    ));

    let mut producers = Vec::new();
    for p in 0..4 {
        let queue = queue.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..5 {
                queue.enqueue_request(Params::new().with("seq", format!("{p}-{i}")));
                queue.dispatcher().process_queue();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    // a trigger racing the final idle transition may start one more pass
    for _ in 0..50 {
        queue.dispatcher().wait_idle().await;
        if queue.store().count().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut delivered = seqs(&transport.delivered());
    assert_eq!(delivered.len(), 20);
    delivered.sort();
    delivered.dedup();
    assert_eq!(delivered.len(), 20);
    assert_eq!(transport.attempts().len(), 20);
}

// ============================================
// Retry policy
// ============================================

#[tokio::test]
async fn test_retry_bound_then_drop() {
    let transport = Arc::new(MockTransport::failing());
    let store = memory_store(100);
    let queue = queue(
        store.clone(),
        transport.clone(),
        DispatchPolicy {
            manual: true,
            ..policy(3, RetryExhaustion::Drop)
        },
    );
    queue.enqueue_request(Params::new().with("seq", 0));
    queue.enqueue_request(Params::new().with("seq", 1));

    let report = queue.dispatcher().drain().await.unwrap();
    assert_eq!(report.dropped, 2);
    assert!(!report.halted);
    assert_eq!(seqs(&transport.attempts()), vec!["0", "0", "0", "1", "1", "1"]);
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_retry_exhaustion_halt_keeps_head() {
    let transport = Arc::new(MockTransport::failing());
    let store = memory_store(100);
    let queue = queue(
        store.clone(),
        transport.clone(),
        DispatchPolicy {
            manual: true,
            ..policy(2, RetryExhaustion::Halt)
        },
    );
    queue.enqueue_request(Params::new().with("seq", 0));
    queue.enqueue_request(Params::new().with("seq", 1));

    let report = queue.dispatcher().drain().await.unwrap();
    assert!(report.halted);
    assert_eq!(seqs(&transport.attempts()), vec!["0", "0"]);
    assert_eq!(store.count().unwrap(), 2);

    transport.fail_all.store(false, Ordering::SeqCst);
    let report = queue.dispatcher().drain().await.unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(seqs(&transport.delivered()), vec!["0", "1"]);
}

// ============================================
// Producers through the context
// ============================================

fn analytics(config: Config, store: Arc<RequestStore>) -> (Analytics, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::default());
    let analytics = Analytics::builder(config)
        .store(store)
        .transport(transport.clone())
        .build()
        .unwrap();
    (analytics, transport)
}

fn event_batches(store: &RequestStore) -> Vec<Vec<Value>> {
    store
        .models()
        .unwrap()
        .iter()
        .filter_map(|r| query_value(r.url.as_deref()?, "events"))
        .map(|events| serde_json::from_str(&events).unwrap())
        .collect()
}

#[tokio::test]
async fn test_threshold_flush() {
    let mut config = config();
    config.queue.event_queue_threshold = 3;
    let store = memory_store(100);
    let (analytics, _) = analytics(config, store.clone());

    analytics.record_event(CustomEvent::new("a"));
    analytics.record_event(CustomEvent::new("b"));
    assert!(event_batches(&store).is_empty());
    analytics.record_event(CustomEvent::new("c"));

    let batches = event_batches(&store);
    assert_eq!(batches.len(), 1);
    let keys: Vec<&str> = batches[0].iter().map(|e| e["key"].as_str().unwrap()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_consent_gating_end_to_end() {
    let mut config = config();
    config.consent.required = true;
    let store = memory_store(100);
    let (analytics, transport) = analytics(config, store.clone());

    assert!(!analytics.record_event(CustomEvent::new("before")));
    assert!(!analytics.begin_session());

    analytics.give_consent(&[Feature::Events]);
    assert!(analytics.record_event(CustomEvent::new("after")));

    let report = analytics.drain_now().await.unwrap();
    let delivered = transport.delivered();
    assert_eq!(report.sent, delivered.len());

    let events: Vec<String> = delivered
        .iter()
        .filter_map(|u| query_value(u, "events"))
        .collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].contains("after"));
    assert!(!events[0].contains("before"));
    assert!(delivered.iter().all(|u| query_value(u, "begin_session").is_none()));
    assert!(delivered.iter().any(|u| query_value(u, "consent").is_some()));
}

#[tokio::test]
async fn test_requests_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    {
        let store = Arc::new(RequestStore::open(&path, 100).unwrap());
        let (analytics, transport) = analytics(config(), store);
        assert!(analytics.begin_session());
        analytics.record_event(CustomEvent::new("purchase"));
        analytics.flush();
        assert_eq!(analytics.pending_requests().unwrap(), 2);
        assert!(transport.delivered().is_empty());
    }

    let store = Arc::new(RequestStore::open(&path, 100).unwrap());
    let (analytics, transport) = analytics(config(), store);
    assert_eq!(analytics.pending_requests().unwrap(), 2);
    assert_eq!(analytics.device_id().id, "device-1");

    let report = analytics.drain_now().await.unwrap();
    assert_eq!(report.sent, 2);
    let delivered = transport.delivered();
    assert!(query_value(&delivered[0], "begin_session").is_some());
    assert!(query_value(&delivered[1], "events").is_some());
}

// ============================================
// Persistence format
// ============================================

#[test]
fn test_migration_idempotent_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let ctx = MigrationContext {
        salt: Some("pepper".to_string()),
    };

    let store = RequestStore::open(&path, 10).unwrap();
    store.migrate(&ctx).unwrap();
    store.enqueue(&Request::get("https://collect.example.com/i?a=1")).unwrap();
    store.enqueue(&Request::post(r#"{"a":2}"#)).unwrap();
    let before = store.models().unwrap();
    drop(store);

    let store = RequestStore::open(&path, 10).unwrap();
    store.migrate(&ctx).unwrap();
    store.migrate(&ctx).unwrap();
    assert_eq!(store.models().unwrap(), before);
    assert_eq!(store.schema_version().unwrap(), pulsekit_core::db::SCHEMA_VERSION);
}

#[test]
fn test_record_round_trip() {
    for request in [
        Request::get("https://collect.example.com/i?app_key=APPKEY&begin_session=1"),
        Request::post(r#"{"app_key":"APPKEY","events":"[]"}"#),
    ] {
        let record = RequestRecord::encode(7, &request);
        let decoded = record.decode().unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.request, request);
    }
}
