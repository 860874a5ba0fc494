//! Crash and exception reporting with a breadcrumb trail

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::{Map, Value};

use crate::config::LimitsConfig;
use crate::consent::ConsentGate;
use crate::dispatch::RequestQueue;
use crate::events::{truncate, Segmentation};
use crate::metrics::MetricsProvider;
use crate::request::Params;
use crate::types::Feature;

/// An exception to report
#[derive(Debug, Clone, Default)]
pub struct CrashReport {
    pub message: String,
    pub stack_trace: String,
    /// False for handled exceptions
    pub unhandled: bool,
    pub segmentation: Vec<(String, Value)>,
}

impl CrashReport {
    pub fn handled(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: stack_trace.into(),
            unhandled: false,
            segmentation: Vec::new(),
        }
    }

    pub fn unhandled(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            unhandled: true,
            ..Self::handled(message, stack_trace)
        }
    }

    pub fn segment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.segmentation.push((key.into(), value.into()));
        self
    }
}

pub struct CrashReporter {
    consent: Arc<ConsentGate>,
    requests: Arc<RequestQueue>,
    metrics: Arc<dyn MetricsProvider>,
    limits: LimitsConfig,
    breadcrumbs: Mutex<VecDeque<String>>,
    started: Instant,
}

impl CrashReporter {
    pub fn new(
        consent: Arc<ConsentGate>,
        requests: Arc<RequestQueue>,
        metrics: Arc<dyn MetricsProvider>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            consent,
            requests,
            metrics,
            limits,
            breadcrumbs: Mutex::new(VecDeque::new()),
            started: Instant::now(),
        }
    }

    fn breadcrumbs(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.breadcrumbs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember a log line to attach to the next crash. The oldest line is
    /// evicted once `max_breadcrumbs` is reached.
    pub fn add_breadcrumb(&self, record: &str) -> bool {
        if !self.consent.check_consent(Feature::Crashes) {
            return false;
        }
        if record.trim().is_empty() {
            tracing::warn!("Ignoring empty breadcrumb");
            return false;
        }
        let record = truncate(record, self.limits.max_breadcrumb_length, "breadcrumb");
        let mut crumbs = self.breadcrumbs();
        while crumbs.len() >= self.limits.max_breadcrumbs.max(1) {
            crumbs.pop_front();
        }
        crumbs.push_back(record);
        true
    }

    pub fn breadcrumb_count(&self) -> usize {
        self.breadcrumbs().len()
    }

    pub fn record_exception(&self, report: CrashReport) -> bool {
        if !self.consent.check_consent(Feature::Crashes) {
            tracing::debug!("No consent for crashes, ignoring");
            return false;
        }
        if report.message.trim().is_empty() && report.stack_trace.trim().is_empty() {
            tracing::warn!("Ignoring crash without message or stack trace");
            return false;
        }

        let crash = self.crash_json(report);
        self.requests
            .enqueue_request(Params::new().with("crash", crash))
            .is_some()
    }

    fn crash_json(&self, report: CrashReport) -> Value {
        let mut crash: Map<String, Value> = self.metrics.metrics();
        let logs = self.breadcrumbs().iter().cloned().collect::<Vec<_>>().join("\n");

        crash.insert("_name".to_string(), Value::from(report.message));
        crash.insert("_error".to_string(), Value::from(report.stack_trace));
        crash.insert("_nonfatal".to_string(), Value::Bool(!report.unhandled));
        crash.insert("_logs".to_string(), Value::from(logs));
        crash.insert("_run".to_string(), Value::from(self.started.elapsed().as_secs()));

        let custom = Segmentation::sanitize(report.segmentation, &self.limits);
        if !custom.is_empty() {
            crash.insert("_custom".to_string(), custom.to_json());
        }
        Value::Object(crash)
    }
}
