//! Request model and its persisted record form

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered request parameters.
///
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<(String, Value)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn extend(&mut self, other: Params) {
        for (k, v) in other.0 {
            self.insert(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Wire payload of a request. The method is frozen at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "UPPERCASE")]
pub enum Payload {
    /// Complete target URL including the query string
    Get { url: String },
    /// Serialized JSON object sent to the collection endpoint
    Post { body: String },
}

/// One unit of outbound work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            payload: Payload::Get { url: url.into() },
            created_at: Utc::now(),
        }
    }

    pub fn post(body: impl Into<String>) -> Self {
        Self {
            payload: Payload::Post { body: body.into() },
            created_at: Utc::now(),
        }
    }

    pub fn is_get(&self) -> bool {
        matches!(self.payload, Payload::Get { .. })
    }

    /// URL for GET requests, body for POST requests
    pub fn data(&self) -> &str {
        match &self.payload {
            Payload::Get { url } => url,
            Payload::Post { body } => body,
        }
    }
}

/// A request together with the id the store assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRequest {
    pub id: i64,
    pub request: Request,
}

/// Flat persisted form of a request, exactly as it sits in the store.
///
/// A record read back from disk is not trusted: [`RequestRecord::decode`]
/// re-checks that the payload column matching `is_get` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub id: i64,
    pub is_get: bool,
    pub url: Option<String>,
    pub body: Option<String>,
    pub created_at: String,
}

impl RequestRecord {
    /// Flatten a request into its persisted columns
    pub fn encode(id: i64, request: &Request) -> Self {
        let (is_get, url, body) = match &request.payload {
            Payload::Get { url } => (true, Some(url.clone()), None),
            Payload::Post { body } => (false, None, Some(body.clone())),
        };
        Self {
            id,
            is_get,
            url,
            body,
            created_at: request.created_at.to_rfc3339(),
        }
    }

    /// Rebuild the request, rejecting records that break the payload invariant
    pub fn decode(&self) -> Result<StoredRequest> {
        let malformed = |reason: &str| Error::MalformedRecord {
            id: self.id,
            reason: reason.to_string(),
        };

        let payload = if self.is_get {
            match self.url.as_deref() {
                Some(url) if !url.is_empty() => Payload::Get {
                    url: url.to_string(),
                },
                _ => return Err(malformed("GET record without url")),
            }
        } else {
            match self.body.as_deref() {
                Some(body) if !body.is_empty() => Payload::Post {
                    body: body.to_string(),
                },
                _ => return Err(malformed("POST record without body")),
            }
        };

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| malformed(&format!("bad created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(StoredRequest {
            id: self.id,
            request: Request {
                payload,
                created_at,
            },
        })
    }
}
