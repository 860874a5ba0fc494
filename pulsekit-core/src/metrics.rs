//! Device metrics attached to begin-session requests

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Supplies the opaque metrics blob embedded in begin-session requests
pub trait MetricsProvider: Send + Sync {
    fn metrics(&self) -> Map<String, Value>;
}

/// Fixed metrics taken from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticMetrics {
    values: Map<String, Value>,
}

impl StaticMetrics {
    /// `_os` defaults to the compile target OS; configured values win
    pub fn from_config(configured: &BTreeMap<String, String>) -> Self {
        let mut values = Map::new();
        values.insert("_os".to_string(), Value::from(std::env::consts::OS));
        for (key, value) in configured {
            values.insert(key.clone(), Value::from(value.as_str()));
        }
        Self { values }
    }
}

impl MetricsProvider for StaticMetrics {
    fn metrics(&self) -> Map<String, Value> {
        self.values.clone()
    }
}
