//! Event model, segmentation values and input limits

use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::config::LimitsConfig;
use crate::request::TimeParts;

/// Reserved key for view events
pub const VIEW_EVENT_KEY: &str = "[CLY]_view";

/// A segmentation value: a scalar or a homogeneous list of scalars
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SegmentValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    Str(String),
    List(Vec<SegmentValue>),
}

impl SegmentValue {
    /// Convert a JSON value, rejecting null, objects, nested or mixed lists
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => {
                let scalars: Option<Vec<_>> = items.iter().map(Self::scalar).collect();
                let mut scalars = scalars?;
                let all_numeric = scalars
                    .iter()
                    .all(|v| matches!(v, SegmentValue::Int(_) | SegmentValue::Float(_)));
                let has_float = scalars.iter().any(|v| matches!(v, SegmentValue::Float(_)));
                if all_numeric && has_float {
                    scalars = scalars
                        .into_iter()
                        .map(|v| match v {
                            SegmentValue::Int(i) => SegmentValue::Float(i as f64),
                            other => other,
                        })
                        .collect();
                }
                let homogeneous = scalars
                    .windows(2)
                    .all(|w| std::mem::discriminant(&w[0]) == std::mem::discriminant(&w[1]));
                homogeneous.then_some(SegmentValue::List(scalars))
            }
            other => Self::scalar(other),
        }
    }

    fn scalar(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(SegmentValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(SegmentValue::Int)
                .or_else(|| n.as_f64().map(SegmentValue::Float)),
            Value::String(s) => Some(SegmentValue::Str(s.clone())),
            _ => None,
        }
    }

    fn truncate_strings(self, max: usize, key: &str) -> Self {
        match self {
            SegmentValue::Str(s) => SegmentValue::Str(truncate(&s, max, key)),
            SegmentValue::List(items) => SegmentValue::List(
                items
                    .into_iter()
                    .map(|v| v.truncate_strings(max, key))
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Ordered segmentation map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segmentation(Vec<(String, SegmentValue)>);

impl Segmentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: SegmentValue) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SegmentValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply key, value and count limits to raw input, logging what is
    /// truncated or dropped
    pub fn sanitize(raw: Vec<(String, Value)>, limits: &LimitsConfig) -> Self {
        let mut segmentation = Segmentation::new();
        let total = raw.len();

        for (key, value) in raw {
            if segmentation.len() >= limits.max_segmentation_values {
                tracing::warn!(
                    limit = limits.max_segmentation_values,
                    dropped = total - segmentation.len(),
                    "Too many segmentation entries, dropping the rest"
                );
                break;
            }
            if key.is_empty() {
                tracing::warn!("Dropping segmentation entry with empty key");
                continue;
            }
            let key = truncate(&key, limits.max_key_length, "segmentation key");
            match SegmentValue::from_json(&value) {
                Some(v) => segmentation.insert(
                    key.clone(),
                    v.truncate_strings(limits.max_value_size, &key),
                ),
                None => {
                    tracing::warn!(key = %key, value = %value, "Dropping unsupported segmentation value");
                }
            }
        }
        segmentation
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

impl Serialize for Segmentation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Truncate to `max` characters, logging when anything was cut
pub(crate) fn truncate(value: &str, max: usize, what: &str) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    tracing::warn!(what, max, "Value exceeds limit, truncating");
    value.chars().take(max).collect()
}

/// A recorded event waiting in a batching queue
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: String,
    pub count: u32,
    pub sum: Option<f64>,
    /// Seconds
    pub duration: Option<f64>,
    pub segmentation: Segmentation,
    pub recorded_at: DateTime<Local>,
}

impl Event {
    pub fn is_view(&self) -> bool {
        self.key == VIEW_EVENT_KEY
    }

    /// Wire form; the time fields are derived from `recorded_at`
    pub fn to_json(&self) -> Value {
        let time = TimeParts::of(&self.recorded_at);
        let mut event = json!({
            "key": self.key,
            "count": self.count,
            "timestamp": time.timestamp,
            "hour": time.hour,
            "dow": time.dow,
            "tz": time.tz,
        });
        if let Some(obj) = event.as_object_mut() {
            if let Some(sum) = self.sum {
                obj.insert("sum".to_string(), json!(sum));
            }
            if let Some(duration) = self.duration {
                obj.insert("dur".to_string(), json!(duration));
            }
            if !self.segmentation.is_empty() {
                obj.insert("segmentation".to_string(), self.segmentation.to_json());
            }
        }
        event
    }
}

/// Builder for a custom event handed to [`crate::Analytics::record_event`]
#[derive(Debug, Clone)]
pub struct CustomEvent {
    key: String,
    count: u32,
    sum: Option<f64>,
    duration: Option<f64>,
    segmentation: Vec<(String, Value)>,
}

impl CustomEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            count: 1,
            sum: None,
            duration: None,
            segmentation: Vec::new(),
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn sum(mut self, sum: f64) -> Self {
        self.sum = Some(sum);
        self
    }

    pub fn duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn segment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.segmentation.push((key.into(), value.into()));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Validate and apply limits. Returns `None` for an empty key.
    pub(crate) fn into_event(self, limits: &LimitsConfig) -> Option<Event> {
        if self.key.trim().is_empty() {
            tracing::warn!("Ignoring event with empty key");
            return None;
        }
        let key = if self.key == VIEW_EVENT_KEY {
            self.key
        } else {
            truncate(&self.key, limits.max_key_length, "event key")
        };
        Some(Event {
            key,
            count: self.count.max(1),
            sum: self.sum,
            duration: self.duration,
            segmentation: Segmentation::sanitize(self.segmentation, limits),
            recorded_at: Local::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            max_key_length: 8,
            max_value_size: 4,
            max_segmentation_values: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_segment_value_kinds() {
        assert_eq!(SegmentValue::from_json(&json!(3)), Some(SegmentValue::Int(3)));
        assert_eq!(SegmentValue::from_json(&json!(1.5)), Some(SegmentValue::Float(1.5)));
        assert_eq!(SegmentValue::from_json(&json!(true)), Some(SegmentValue::Bool(true)));
        assert_eq!(
            SegmentValue::from_json(&json!(["a", "b"])),
            Some(SegmentValue::List(vec![
                SegmentValue::Str("a".into()),
                SegmentValue::Str("b".into())
            ]))
        );
        assert_eq!(
            SegmentValue::from_json(&json!([1, 2.5])),
            Some(SegmentValue::List(vec![
                SegmentValue::Float(1.0),
                SegmentValue::Float(2.5)
            ]))
        );
        assert_eq!(SegmentValue::from_json(&json!(null)), None);
        assert_eq!(SegmentValue::from_json(&json!({"a": 1})), None);
        assert_eq!(SegmentValue::from_json(&json!(["a", 1])), None);
        assert_eq!(SegmentValue::from_json(&json!([[1]])), None);
    }

    #[test]
    fn test_sanitize_applies_limits() {
        let raw = vec![
            ("plan".to_string(), json!("premium")),
            ("nested".to_string(), json!({"x": 1})),
            ("a_very_long_key".to_string(), json!(1)),
            ("".to_string(), json!(1)),
            ("ok".to_string(), json!(false)),
            ("overflow".to_string(), json!(2)),
        ];
        let segmentation = Segmentation::sanitize(raw, &limits());

        assert_eq!(segmentation.len(), 3);
        assert_eq!(
            segmentation.get("plan"),
            Some(&SegmentValue::Str("prem".into()))
        );
        assert!(segmentation.get("nested").is_none());
        assert_eq!(segmentation.get("a_very_l"), Some(&SegmentValue::Int(1)));
        assert_eq!(segmentation.get("ok"), Some(&SegmentValue::Bool(false)));
        assert!(segmentation.get("overflow").is_none());
    }

    #[test]
    fn test_segmentation_serializes_in_order() {
        let mut segmentation = Segmentation::new();
        segmentation.insert("z", SegmentValue::Int(1));
        segmentation.insert("a", SegmentValue::Str("x".into()));
        assert_eq!(
            serde_json::to_string(&segmentation).unwrap(),
            r#"{"z":1,"a":"x"}"#
        );
    }

    #[test]
    fn test_custom_event_validation() {
        assert!(CustomEvent::new("  ").into_event(&limits()).is_none());

        let event = CustomEvent::new("purchase_completed")
            .count(0)
            .sum(9.5)
            .segment("plan", "pro")
            .into_event(&limits())
            .unwrap();
        assert_eq!(event.key, "purchase");
        assert_eq!(event.count, 1);

        let json = event.to_json();
        assert_eq!(json["key"], "purchase");
        assert_eq!(json["sum"], 9.5);
        assert_eq!(json["segmentation"]["plan"], "pro");
        assert!(json.get("dur").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2, "test"), "hé");
        assert_eq!(truncate("abc", 3, "test"), "abc");
    }
}
