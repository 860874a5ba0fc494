//! Consent gate
//!
//! Answers "is feature X allowed" for producers. When consent is not
//! required every feature is allowed and the mutators are no-ops. When it is
//! required, every effective change enqueues a `consent` request with the
//! changed features and is reported to registered listeners.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};

use crate::config::ConsentConfig;
use crate::dispatch::RequestQueue;
use crate::request::Params;
use crate::types::Feature;

/// Features whose consent value actually changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsentDelta {
    changes: Vec<(Feature, bool)>,
}

impl ConsentDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[(Feature, bool)] {
        &self.changes
    }

    pub fn granted(&self, feature: Feature) -> bool {
        self.changes.contains(&(feature, true))
    }

    pub fn revoked(&self, feature: Feature) -> bool {
        self.changes.contains(&(feature, false))
    }

    fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .changes
            .iter()
            .map(|(f, v)| (f.as_str().to_string(), Value::Bool(*v)))
            .collect();
        Value::Object(map)
    }
}

/// Callback invoked after an effective consent change
pub type ConsentListener = Arc<dyn Fn(&ConsentDelta) + Send + Sync>;

struct ConsentState {
    given: BTreeMap<Feature, bool>,
    groups: BTreeMap<String, Vec<Feature>>,
}

pub struct ConsentGate {
    required: bool,
    state: Mutex<ConsentState>,
    listeners: Mutex<Vec<ConsentListener>>,
    requests: Arc<RequestQueue>,
}

impl ConsentGate {
    pub fn new(config: &ConsentConfig, requests: Arc<RequestQueue>) -> Self {
        let mut given: BTreeMap<Feature, bool> =
            Feature::ALL.into_iter().map(|f| (f, false)).collect();
        if config.required {
            for feature in &config.given {
                given.insert(*feature, true);
            }
            for group in &config.given_groups {
                for feature in config.groups.get(group).into_iter().flatten() {
                    given.insert(*feature, true);
                }
            }
        }

        Self {
            required: config.required,
            state: Mutex::new(ConsentState {
                given,
                groups: config.groups.clone(),
            }),
            listeners: Mutex::new(Vec::new()),
            requests,
        }
    }

    fn state(&self) -> MutexGuard<'_, ConsentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn requires_consent(&self) -> bool {
        self.required
    }

    /// Enqueue the full consent state; sent once at startup when required
    pub fn send_initial_state(&self) {
        if !self.required {
            return;
        }
        let delta = ConsentDelta {
            changes: self
                .state()
                .given
                .iter()
                .map(|(f, v)| (*f, *v))
                .collect(),
        };
        self.requests
            .enqueue_request(Params::new().with("consent", delta.to_json()));
    }

    pub fn check_consent(&self, feature: Feature) -> bool {
        if !self.required {
            return true;
        }
        self.state().given.get(&feature).copied().unwrap_or(false)
    }

    /// Features currently allowed
    pub fn granted(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.check_consent(*f))
            .collect()
    }

    pub fn subscribe(&self, listener: ConsentListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn give_consent(&self, features: &[Feature]) -> ConsentDelta {
        self.apply(features, true)
    }

    pub fn remove_consent(&self, features: &[Feature]) -> ConsentDelta {
        self.apply(features, false)
    }

    pub fn give_all_consent(&self) -> ConsentDelta {
        self.apply(&Feature::ALL, true)
    }

    pub fn remove_all_consent(&self) -> ConsentDelta {
        self.apply(&Feature::ALL, false)
    }

    pub fn give_consent_to_group(&self, groups: &[&str]) -> ConsentDelta {
        let features = self.group_features(groups);
        self.apply(&features, true)
    }

    pub fn remove_consent_from_group(&self, groups: &[&str]) -> ConsentDelta {
        let features = self.group_features(groups);
        self.apply(&features, false)
    }

    /// Define or replace a named group of features
    pub fn create_consent_group(&self, name: &str, features: &[Feature]) {
        if !self.required {
            tracing::debug!(group = name, "Consent not required, ignoring group");
            return;
        }
        if name.trim().is_empty() {
            tracing::warn!("Ignoring consent group with empty name");
            return;
        }
        self.state()
            .groups
            .insert(name.to_string(), features.to_vec());
    }

    fn group_features(&self, groups: &[&str]) -> Vec<Feature> {
        let state = self.state();
        let mut features = Vec::new();
        for group in groups {
            match state.groups.get(*group) {
                Some(members) => features.extend(members.iter().copied()),
                None => tracing::warn!(group, "Unknown consent group"),
            }
        }
        features
    }

    fn apply(&self, features: &[Feature], value: bool) -> ConsentDelta {
        if !self.required {
            tracing::debug!("Consent not required, ignoring change");
            return ConsentDelta::default();
        }

        let delta = {
            let mut state = self.state();
            let mut changes = Vec::new();
            for feature in features {
                let current = state.given.entry(*feature).or_insert(false);
                if *current != value {
                    *current = value;
                    changes.push((*feature, value));
                }
            }
            ConsentDelta { changes }
        };

        if delta.is_empty() {
            return delta;
        }

        tracing::info!(changes = ?delta.changes, "Consent changed");
        self.requests
            .enqueue_request(Params::new().with("consent", delta.to_json()));

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(&delta);
        }
        delta
    }
}
