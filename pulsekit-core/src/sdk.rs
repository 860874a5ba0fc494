//! The analytics context
//!
//! [`Analytics`] wires the request store, dispatch engine, consent gate,
//! event queues and producers together. It is an explicit value owned by the
//! host application; clones share the same state.
//!
//! Public methods serialize on one coarse lock so that compound operations
//! (consent check, build, enqueue, identity changes) never interleave.
//! Consent and device-id listeners run while that lock is held and must not
//! call back into the context.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::runtime::Handle;

use crate::config::Config;
use crate::consent::{ConsentDelta, ConsentGate, ConsentListener};
use crate::crash::{CrashReport, CrashReporter};
use crate::db::{MigrationContext, RequestStore};
use crate::device::DeviceIdentity;
use crate::dispatch::{
    DispatchPolicy, Dispatcher, DrainReport, DrainState, HttpTransport, RequestQueue, Transport,
};
use crate::error::{Error, Result};
use crate::events::{CustomEvent, EventQueues, EventService};
use crate::location::{Location, LocationCache};
use crate::metrics::{MetricsProvider, StaticMetrics};
use crate::remote_config::RemoteConfig;
use crate::request::{Params, RequestBuilder};
use crate::session::{SessionCoordinator, SessionTimer};
use crate::types::{DeviceId, Feature};
use crate::user::{PropertyOp, UserDetails, UserProfile};

/// Callback invoked with the previous and the new device id
pub type DeviceIdListener = Arc<dyn Fn(&DeviceId, &DeviceId) + Send + Sync>;

/// Builder for [`Analytics`]
pub struct AnalyticsBuilder {
    config: Config,
    store: Option<Arc<RequestStore>>,
    transport: Option<Arc<dyn Transport>>,
    metrics: Option<Arc<dyn MetricsProvider>>,
    runtime: Option<Handle>,
}

impl AnalyticsBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            metrics: None,
            runtime: None,
        }
    }

    /// Use an already opened store instead of the default database path
    pub fn store(mut self, store: Arc<RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runtime the drain loop and session timer are spawned on. Defaults to
    /// the runtime `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Analytics> {
        let config = self.config;
        config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|e| Error::Config(format!("no tokio runtime available: {e}")))?,
        };

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(RequestStore::open(
                &Config::database_path(),
                config.queue.stored_request_limit,
            )?),
        };
        store.migrate(&MigrationContext {
            salt: config.server.salt.clone().filter(|s| !s.is_empty()),
        })?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.server)?),
        };
        let metrics: Arc<dyn MetricsProvider> = self
            .metrics
            .unwrap_or_else(|| Arc::new(StaticMetrics::from_config(&config.metrics)));

        let identity = Arc::new(DeviceIdentity::resolve(
            &store,
            config.server.device_id.as_deref(),
        )?);
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            DispatchPolicy::from(&config.queue),
            runtime.clone(),
        );
        let builder = RequestBuilder::new(&config.server, identity.clone())?;
        let requests = Arc::new(RequestQueue::new(builder, store.clone(), dispatcher));

        let consent = Arc::new(ConsentGate::new(&config.consent, requests.clone()));
        let queues = Arc::new(EventQueues::new(
            config.queue.event_queue_threshold,
            requests.clone(),
        ));
        let events = EventService::new(consent.clone(), queues.clone(), config.limits.clone());
        let location = Arc::new(LocationCache::from_config(&config.location));
        let session = SessionCoordinator::new(
            consent.clone(),
            queues.clone(),
            requests.clone(),
            metrics.clone(),
            location.clone(),
        );
        let crashes = CrashReporter::new(
            consent.clone(),
            requests.clone(),
            metrics,
            config.limits.clone(),
        );
        let user = UserProfile::new(consent.clone(), requests.clone(), config.limits.clone());
        let remote_config = Arc::new(RemoteConfig::new(
            consent.clone(),
            requests.clone(),
            transport,
        ));

        let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
            let weak = me.clone();
            consent.subscribe(Arc::new(move |delta: &ConsentDelta| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_consent_changed(delta);
                }
            }));

            Inner {
                me: me.clone(),
                config,
                runtime,
                guard: Mutex::new(()),
                store,
                identity,
                requests,
                consent,
                queues,
                events,
                session,
                timer: SessionTimer::default(),
                location,
                crashes,
                user,
                remote_config,
                device_listeners: Mutex::new(Vec::new()),
            }
        });

        {
            let _guard = inner.guard();
            inner.consent.send_initial_state();
            if inner.config.session.automatic_tracking {
                inner.begin_tracking();
            }
        }
        inner.requests.dispatcher().process_queue();
        if inner.config.remote_config.fetch_on_start {
            let remote_config = inner.remote_config.clone();
            inner.runtime.spawn(async move {
                if let Err(e) = remote_config.fetch().await {
                    tracing::warn!(error = %e, "Remote config fetch on start failed");
                }
            });
        }

        tracing::info!(
            device_id = %inner.identity.current().id,
            pending = inner.store.count().unwrap_or_default(),
            "Analytics started"
        );
        Ok(Analytics { inner })
    }
}

struct Inner {
    me: Weak<Inner>,
    config: Config,
    runtime: Handle,
    guard: Mutex<()>,
    store: Arc<RequestStore>,
    identity: Arc<DeviceIdentity>,
    requests: Arc<RequestQueue>,
    consent: Arc<ConsentGate>,
    queues: Arc<EventQueues>,
    events: EventService,
    session: SessionCoordinator,
    timer: SessionTimer,
    location: Arc<LocationCache>,
    crashes: CrashReporter,
    user: UserProfile,
    remote_config: Arc<RemoteConfig>,
    device_listeners: Mutex<Vec<DeviceIdListener>>,
}

impl Inner {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn automatic(&self) -> bool {
        self.config.session.automatic_tracking
    }

    /// Begin a session and keep it extended on the session timer
    fn begin_tracking(&self) {
        if !self.session.begin() {
            return;
        }
        let weak = self.me.clone();
        self.timer
            .start(&self.runtime, self.config.session.duration(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.tick();
                }
            });
    }

    fn stop_tracking(&self) {
        self.timer.stop();
        self.session.finish();
    }

    fn tick(&self) {
        let _guard = self.guard();
        self.session.extend();
        self.requests.dispatcher().process_queue();
    }

    fn on_consent_changed(&self, delta: &ConsentDelta) {
        if delta.revoked(Feature::Location) {
            self.location.clear();
            self.requests.enqueue_request(LocationCache::erase_params());
        }
        if delta.granted(Feature::Sessions) && self.automatic() {
            self.begin_tracking();
        }
        if delta.revoked(Feature::Sessions) {
            self.stop_tracking();
        }
        if delta.revoked(Feature::RemoteConfig) {
            self.remote_config.clear();
        }
    }

    fn notify_device_change(&self, previous: &DeviceId, current: &DeviceId) {
        let listeners = self
            .device_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(previous, current);
        }
    }
}

/// Handle to a running analytics context
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<Inner>,
}

impl Analytics {
    pub fn builder(config: Config) -> AnalyticsBuilder {
        AnalyticsBuilder::new(config)
    }

    // Events

    pub fn record_event(&self, event: CustomEvent) -> bool {
        let _guard = self.inner.guard();
        self.inner.events.record_event(event)
    }

    pub fn start_event(&self, key: &str) -> bool {
        let _guard = self.inner.guard();
        self.inner.events.start_event(key)
    }

    pub fn end_event(&self, event: CustomEvent) -> bool {
        let _guard = self.inner.guard();
        self.inner.events.end_event(event)
    }

    pub fn cancel_event(&self, key: &str) -> bool {
        let _guard = self.inner.guard();
        self.inner.events.cancel_event(key)
    }

    pub fn record_view(&self, name: &str, segmentation: Vec<(String, Value)>) -> bool {
        let _guard = self.inner.guard();
        self.inner.events.record_view(name, segmentation)
    }

    pub fn close_view(&self) -> bool {
        let _guard = self.inner.guard();
        self.inner.events.close_view()
    }

    // Sessions

    /// Manual session control; ignored while automatic tracking is on
    pub fn begin_session(&self) -> bool {
        if self.manual_session_ignored() {
            return false;
        }
        let _guard = self.inner.guard();
        self.inner.session.begin()
    }

    pub fn extend_session(&self) -> bool {
        if self.manual_session_ignored() {
            return false;
        }
        let _guard = self.inner.guard();
        self.inner.session.extend()
    }

    pub fn end_session(&self) -> bool {
        if self.manual_session_ignored() {
            return false;
        }
        let _guard = self.inner.guard();
        self.inner.session.end()
    }

    fn manual_session_ignored(&self) -> bool {
        if self.inner.automatic() {
            tracing::warn!("Automatic session tracking is on, ignoring manual session call");
            return true;
        }
        false
    }

    pub fn session_active(&self) -> bool {
        self.inner.session.is_active()
    }

    // Location

    /// Cache a location; sent right away if a session is running
    pub fn set_location(&self, location: Location) -> bool {
        let _guard = self.inner.guard();
        if !self.inner.consent.check_consent(Feature::Location) {
            tracing::debug!("No consent for location, ignoring");
            return false;
        }
        self.inner.location.set(location);
        if self.inner.session.is_active() {
            let params = self.inner.location.params();
            if !params.is_empty() {
                self.inner.requests.enqueue_request(params);
            }
        }
        true
    }

    /// Erase the location and stop the server from resolving one
    pub fn disable_location(&self) {
        let _guard = self.inner.guard();
        self.inner.location.disable();
        self.inner
            .requests
            .enqueue_request(LocationCache::erase_params());
    }

    // Users

    pub fn set_user_details(&self, details: &UserDetails) -> Result<bool> {
        let _guard = self.inner.guard();
        self.inner.user.set_user_details(details)
    }

    pub fn set_user_property(&self, key: &str, value: impl Into<Value>) -> bool {
        let _guard = self.inner.guard();
        self.inner.user.set(key, value)
    }

    pub fn modify_user_property(&self, key: &str, op: PropertyOp, value: impl Into<Value>) -> bool {
        let _guard = self.inner.guard();
        self.inner.user.modify(key, op, value)
    }

    pub fn save_user_properties(&self) -> bool {
        let _guard = self.inner.guard();
        self.inner.user.save()
    }

    // Crashes

    pub fn add_breadcrumb(&self, record: &str) -> bool {
        let _guard = self.inner.guard();
        self.inner.crashes.add_breadcrumb(record)
    }

    pub fn record_exception(&self, report: CrashReport) -> bool {
        let _guard = self.inner.guard();
        self.inner.crashes.record_exception(report)
    }

    // Consent

    pub fn check_consent(&self, feature: Feature) -> bool {
        self.inner.consent.check_consent(feature)
    }

    pub fn give_consent(&self, features: &[Feature]) -> ConsentDelta {
        let _guard = self.inner.guard();
        self.inner.consent.give_consent(features)
    }

    pub fn remove_consent(&self, features: &[Feature]) -> ConsentDelta {
        let _guard = self.inner.guard();
        self.inner.consent.remove_consent(features)
    }

    pub fn give_all_consent(&self) -> ConsentDelta {
        let _guard = self.inner.guard();
        self.inner.consent.give_all_consent()
    }

    pub fn remove_all_consent(&self) -> ConsentDelta {
        let _guard = self.inner.guard();
        self.inner.consent.remove_all_consent()
    }

    pub fn give_consent_to_group(&self, groups: &[&str]) -> ConsentDelta {
        let _guard = self.inner.guard();
        self.inner.consent.give_consent_to_group(groups)
    }

    pub fn remove_consent_from_group(&self, groups: &[&str]) -> ConsentDelta {
        let _guard = self.inner.guard();
        self.inner.consent.remove_consent_from_group(groups)
    }

    pub fn create_consent_group(&self, name: &str, features: &[Feature]) {
        self.inner.consent.create_consent_group(name, features);
    }

    pub fn on_consent_changed(&self, listener: ConsentListener) {
        self.inner.consent.subscribe(listener);
    }

    // Device id

    pub fn device_id(&self) -> DeviceId {
        self.inner.identity.current()
    }

    pub fn on_device_id_changed(&self, listener: DeviceIdListener) {
        self.inner
            .device_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Switch to a new device id, closing out everything recorded under the
    /// old one. Returns `Ok(false)` when the id is unchanged.
    pub fn change_device_id_without_merge(&self, device_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let _guard = inner.guard();
        let Some(next) = Self::next_device_id(inner, device_id)? else {
            return Ok(false);
        };

        inner.queues.flush_all();
        let cancelled = inner.events.cancel_all_timed();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled timed events for device id change");
        }
        if inner.automatic() {
            inner.stop_tracking();
        }

        let previous = inner.identity.replace(&inner.store, next);
        inner.remote_config.clear();
        if inner.consent.requires_consent() {
            inner.consent.remove_all_consent();
        }
        if inner.automatic() {
            inner.begin_tracking();
        }

        let current = inner.identity.current();
        tracing::info!(from = %previous.id, to = %current.id, "Device id changed");
        inner.notify_device_change(&previous, &current);
        Ok(true)
    }

    /// Switch to a new device id and ask the server to merge the old one
    /// into it. The running session continues.
    pub fn change_device_id_with_merge(&self, device_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let _guard = inner.guard();
        let Some(next) = Self::next_device_id(inner, device_id)? else {
            return Ok(false);
        };

        let previous = inner.identity.replace(&inner.store, next);
        inner
            .requests
            .enqueue_request(Params::new().with("old_device_id", previous.id.as_str()));

        let current = inner.identity.current();
        tracing::info!(from = %previous.id, to = %current.id, "Device id merged");
        inner.notify_device_change(&previous, &current);
        Ok(true)
    }

    fn next_device_id(inner: &Inner, device_id: &str) -> Result<Option<DeviceId>> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(Error::Validation("device id must not be empty".to_string()));
        }
        if inner.identity.current().id == device_id {
            tracing::debug!(device_id, "Device id unchanged");
            return Ok(None);
        }
        Ok(Some(DeviceId::developer(device_id)))
    }

    // Remote config

    /// Fetch server-provided values. Does not take the context lock, so it
    /// may run alongside other calls.
    pub async fn fetch_remote_config(&self) -> Result<bool> {
        self.inner.remote_config.fetch().await
    }

    pub fn remote_config_value(&self, key: &str) -> Option<Value> {
        self.inner.remote_config.get(key)
    }

    pub fn remote_config(&self) -> serde_json::Map<String, Value> {
        self.inner.remote_config.values()
    }

    // Delivery

    /// Flush both event queues and trigger a drain
    pub fn flush(&self) {
        {
            let _guard = self.inner.guard();
            self.inner.queues.flush_all();
        }
        self.inner.requests.dispatcher().process_queue();
    }

    pub fn pending_requests(&self) -> Result<usize> {
        self.inner.store.count()
    }

    /// Flush and drain inline. `None` if a drain was already running.
    pub async fn drain_now(&self) -> Option<DrainReport> {
        {
            let _guard = self.inner.guard();
            self.inner.queues.flush_all();
        }
        self.inner.requests.dispatcher().drain().await
    }

    /// Resolve once no drain is running
    pub async fn wait_idle(&self) {
        self.inner.requests.dispatcher().wait_idle().await;
    }

    pub fn dispatch_state(&self) -> DrainState {
        self.inner.requests.dispatcher().state()
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.inner.store
    }

    /// Flush, stop the session timer, end an automatic session and trigger
    /// a last drain. Does not wait for delivery.
    pub fn shutdown(&self) {
        {
            let _guard = self.inner.guard();
            self.inner.queues.flush_all();
            self.inner.timer.stop();
            if self.inner.automatic() {
                self.inner.session.finish();
            }
        }
        self.inner.requests.dispatcher().process_queue();
        tracing::info!("Analytics shut down");
    }
}
