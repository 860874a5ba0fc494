//! User profile details and custom property modifications

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::LimitsConfig;
use crate::consent::ConsentGate;
use crate::dispatch::RequestQueue;
use crate::error::{Error, Result};
use crate::events::truncate;
use crate::request::Params;
use crate::types::Feature;

const PICTURE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// Predefined user properties
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// URL of a png, jpg, jpeg or gif image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Birth year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byear: Option<i32>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

/// Reject picture URLs whose path does not end in a supported image extension
pub fn validate_picture_url(url: &str) -> Result<()> {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.contains('/'));
    match extension {
        Some(ext) if PICTURE_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(Error::InvalidPictureUrl(url.to_string())),
    }
}

/// Modification applied to a custom property on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOp {
    SetOnce,
    Increment,
    Multiply,
    Max,
    Min,
    Push,
    AddToSet,
    Pull,
}

impl PropertyOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyOp::SetOnce => "$setOnce",
            PropertyOp::Increment => "$inc",
            PropertyOp::Multiply => "$mul",
            PropertyOp::Max => "$max",
            PropertyOp::Min => "$min",
            PropertyOp::Push => "$push",
            PropertyOp::AddToSet => "$addToSet",
            PropertyOp::Pull => "$pull",
        }
    }

    /// Operators collecting values into an array
    fn accumulates(&self) -> bool {
        matches!(self, PropertyOp::Push | PropertyOp::AddToSet | PropertyOp::Pull)
    }
}

pub struct UserProfile {
    consent: Arc<ConsentGate>,
    requests: Arc<RequestQueue>,
    limits: LimitsConfig,
    pending: Mutex<Map<String, Value>>,
}

impl UserProfile {
    pub fn new(consent: Arc<ConsentGate>, requests: Arc<RequestQueue>, limits: LimitsConfig) -> Self {
        Self {
            consent,
            requests,
            limits,
            pending: Mutex::new(Map::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send the predefined details at once.
    ///
    /// An unsupported picture URL is an error; missing consent is `Ok(false)`.
    pub fn set_user_details(&self, details: &UserDetails) -> Result<bool> {
        if let Some(picture) = &details.picture {
            validate_picture_url(picture)?;
        }
        if !self.consent.check_consent(Feature::Users) {
            tracing::debug!("No consent for users, ignoring details");
            return Ok(false);
        }
        let details = serde_json::to_value(details)?;
        Ok(self
            .requests
            .enqueue_request(Params::new().with("user_details", details))
            .is_some())
    }

    /// Stage a custom property value until [`UserProfile::save`]
    pub fn set(&self, key: &str, value: impl Into<Value>) -> bool {
        let Some(key) = self.accept_key(key) else {
            return false;
        };
        self.pending().insert(key, self.limit_value(value.into()));
        true
    }

    /// Stage a property modification until [`UserProfile::save`]
    pub fn modify(&self, key: &str, op: PropertyOp, value: impl Into<Value>) -> bool {
        let Some(key) = self.accept_key(key) else {
            return false;
        };
        let value = self.limit_value(value.into());

        let mut pending = self.pending();
        let entry = pending
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(ops) = entry {
            if op.accumulates() {
                let slot = ops
                    .entry(op.as_str())
                    .or_insert_with(|| Value::Array(Vec::new()));
                match slot {
                    Value::Array(items) => items.push(value),
                    other => *other = Value::Array(vec![other.take(), value]),
                }
            } else {
                ops.insert(op.as_str().to_string(), value);
            }
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send staged properties as one `user_details` request
    pub fn save(&self) -> bool {
        let custom = std::mem::take(&mut *self.pending());
        if custom.is_empty() {
            return false;
        }
        if !self.consent.check_consent(Feature::Users) {
            tracing::debug!(dropped = custom.len(), "No consent for users, dropping properties");
            return false;
        }
        let mut details = Map::new();
        details.insert("custom".to_string(), Value::Object(custom));
        self.requests
            .enqueue_request(Params::new().with("user_details", Value::Object(details)))
            .is_some()
    }

    /// Forget staged properties without sending them
    pub fn clear(&self) {
        self.pending().clear();
    }

    fn accept_key(&self, key: &str) -> Option<String> {
        if !self.consent.check_consent(Feature::Users) {
            return None;
        }
        if key.trim().is_empty() {
            tracing::warn!("Ignoring user property with empty key");
            return None;
        }
        Some(truncate(key, self.limits.max_key_length, "user property key"))
    }

    fn limit_value(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(truncate(&s, self.limits.max_value_size, "user property value")),
            other => other,
        }
    }
}
