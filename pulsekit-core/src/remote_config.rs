//! Server-provided configuration
//!
//! Values are fetched from the read endpoint on demand, cached in the store's
//! settings table and served from memory. Fetching needs `remote-config`
//! consent; revoking it, or switching device id without merge, clears the
//! cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};

use crate::consent::ConsentGate;
use crate::dispatch::{RequestQueue, Transport};
use crate::error::{Error, Result};
use crate::request::Params;
use crate::types::Feature;

const REMOTE_CONFIG_KEY: &str = "remote_config";

pub struct RemoteConfig {
    consent: Arc<ConsentGate>,
    requests: Arc<RequestQueue>,
    transport: Arc<dyn Transport>,
    values: RwLock<Map<String, Value>>,
    /// Bumped by `clear`; a fetch that started before a clear is discarded
    generation: AtomicU64,
}

impl RemoteConfig {
    /// Start from whatever the store cached last time
    pub fn new(
        consent: Arc<ConsentGate>,
        requests: Arc<RequestQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let values = match requests.store().get_setting(REMOTE_CONFIG_KEY) {
            Ok(Some(raw)) => parse_values(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring unreadable cached remote config");
                Map::new()
            }),
            Ok(None) => Map::new(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load cached remote config");
                Map::new()
            }
        };

        Self {
            consent,
            requests,
            transport,
            values: RwLock::new(values),
            generation: AtomicU64::new(0),
        }
    }

    /// Fetch fresh values and replace the cache.
    ///
    /// Returns `Ok(false)` without a network call when consent is missing,
    /// or when the cache was cleared while the fetch was in flight.
    pub async fn fetch(&self) -> Result<bool> {
        if !self.consent.check_consent(Feature::RemoteConfig) {
            tracing::debug!("No consent for remote config, skipping fetch");
            return Ok(false);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let request = self
            .requests
            .builder()
            .build_fetch(&Params::new().with("method", "fetch_remote_config"));
        let body = self.transport.send(&request).await?;
        let values = parse_values(&body)?;

        let mut current = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Remote config cleared during fetch, discarding response");
            return Ok(false);
        }
        if let Err(e) = self.requests.store().set_setting(REMOTE_CONFIG_KEY, &body) {
            tracing::error!(error = %e, "Failed to cache remote config, keeping it in memory");
        }
        tracing::info!(keys = values.len(), "Remote config updated");
        *current = values;
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn values(&self) -> Map<String, Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget cached values in memory and in the store
    pub fn clear(&self) {
        let mut current = self.values.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        current.clear();
        if let Err(e) = self.requests.store().delete_setting(REMOTE_CONFIG_KEY) {
            tracing::error!(error = %e, "Failed to delete cached remote config");
        }
    }
}

fn parse_values(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Transport(format!(
            "remote config is not a JSON object: {other}"
        ))),
    }
}
