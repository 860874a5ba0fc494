//! Request construction: base parameters, GET/POST choice and checksums.
//!
//! GET checksums are computed over the escaped query string exactly as it
//! appears after `?` on the wire, with the salt appended. POST checksums are
//! computed over the serialized JSON object without the checksum property.

use crate::config::ServerConfig;
use crate::device::DeviceIdentity;
use crate::error::Result;
use chrono::{DateTime, Datelike, Local, Timelike};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::model::{Params, Request};

pub const SDK_NAME: &str = "pulsekit-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Query strings longer than this are sent as POST
pub const MAX_GET_LENGTH: usize = 1800;

/// Parameter carrying the request checksum
pub const CHECKSUM_PARAM: &str = "checksum256";

/// Local-time breakdown attached to requests and events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParts {
    /// Unix time in milliseconds
    pub timestamp: i64,
    pub hour: u32,
    /// Day of week, Sunday = 0
    pub dow: u32,
    /// Offset from UTC in minutes
    pub tz: i32,
}

impl TimeParts {
    pub fn of(at: &DateTime<Local>) -> Self {
        Self {
            timestamp: at.timestamp_millis(),
            hour: at.hour(),
            dow: at.weekday().num_days_from_sunday(),
            tz: at.offset().local_minus_utc() / 60,
        }
    }

    pub fn now() -> Self {
        Self::of(&Local::now())
    }
}

/// Builds signed requests for the configured server and current device id
pub struct RequestBuilder {
    base_url: String,
    app_key: String,
    salt: Option<String>,
    enable_post: bool,
    identity: Arc<DeviceIdentity>,
}

impl RequestBuilder {
    pub fn new(server: &ServerConfig, identity: Arc<DeviceIdentity>) -> Result<Self> {
        server.validate()?;
        Ok(Self {
            base_url: server.base_url()?,
            app_key: server.app_key.clone().unwrap_or_default(),
            salt: server.salt.clone().filter(|s| !s.is_empty()),
            enable_post: server.enable_post,
            identity,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request stamped with the current local time
    pub fn build(&self, params: &Params) -> Request {
        self.build_at(params, &Local::now())
    }

    /// Build a request stamped with `now`.
    ///
    /// In a GET query caller params follow the base params. POST bodies are
    /// a flat JSON object with sorted keys. Empty keys and null values are
    /// skipped.
    pub fn build_at(&self, params: &Params, now: &DateTime<Local>) -> Request {
        let mut all = self.base_params(now);
        for (key, value) in params.iter() {
            if key.is_empty() || value.is_null() {
                continue;
            }
            all.insert(key, value.clone());
        }

        let query = encode_query(&all);
        if self.enable_post || query.len() > MAX_GET_LENGTH {
            Request::post(post_body(&all, self.salt.as_deref()))
        } else {
            Request::get(format!(
                "{}/i?{}",
                self.base_url,
                sign_query(query, self.salt.as_deref())
            ))
        }
    }

    /// GET request to the read endpoint (`/o/sdk`). Never queued, so it is
    /// always a GET regardless of length or `enable_post`.
    pub fn build_fetch(&self, params: &Params) -> Request {
        let mut all = self.base_params(&Local::now());
        for (key, value) in params.iter() {
            if !key.is_empty() && !value.is_null() {
                all.insert(key, value.clone());
            }
        }
        Request::get(format!(
            "{}/o/sdk?{}",
            self.base_url,
            sign_query(encode_query(&all), self.salt.as_deref())
        ))
    }

    fn base_params(&self, now: &DateTime<Local>) -> Params {
        let device = self.identity.current();
        let time = TimeParts::of(now);
        Params::new()
            .with("app_key", self.app_key.as_str())
            .with("device_id", device.id)
            .with("t", device.kind.code())
            .with("sdk_name", SDK_NAME)
            .with("sdk_version", SDK_VERSION)
            .with("timestamp", time.timestamp)
            .with("hour", time.hour)
            .with("dow", time.dow)
            .with("tz", time.tz)
    }
}

/// Textual form of a parameter value; strings are sent verbatim
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Escape params into `k=v&k=v` form
pub fn encode_query(params: &Params) -> String {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(&value_text(v))
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex SHA-256 of `data` followed by `salt`
pub fn checksum(data: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append `&checksum256=...` when a salt is configured
pub fn sign_query(query: String, salt: Option<&str>) -> String {
    match salt {
        Some(salt) => {
            let sum = checksum(&query, salt);
            format!("{query}&{CHECKSUM_PARAM}={sum}")
        }
        None => query,
    }
}

/// Serialize params into a flat JSON object of strings, embedding the
/// checksum when salted. Nested values are carried as JSON text, the same
/// text a GET query would hold.
pub fn post_body(params: &Params, salt: Option<&str>) -> String {
    let map: Map<String, Value> = params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), Value::String(value_text(v))))
        .collect();
    sign_body(map, salt)
}

/// Serialize a JSON object, embedding the checksum when salted
pub fn sign_body(mut map: Map<String, Value>, salt: Option<&str>) -> String {
    map.remove(CHECKSUM_PARAM);
    let unsigned = Value::Object(map.clone()).to_string();
    match salt {
        Some(salt) => {
            map.insert(
                CHECKSUM_PARAM.to_string(),
                Value::String(checksum(&unsigned, salt)),
            );
            Value::Object(map).to_string()
        }
        None => unsigned,
    }
}

/// Drop any `checksum256` pair from a GET target, keeping the rest intact
pub fn strip_url_checksum(url: &str) -> String {
    let Some((target, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            !key.is_empty() && key != CHECKSUM_PARAM
        })
        .collect();
    format!("{}?{}", target, kept.join("&"))
}

/// Re-sign a GET target with `salt`, replacing any existing checksum
pub fn resign_url(url: &str, salt: Option<&str>) -> String {
    let stripped = strip_url_checksum(url);
    match stripped.split_once('?') {
        Some((target, query)) => format!("{}?{}", target, sign_query(query.to_string(), salt)),
        None => stripped,
    }
}
