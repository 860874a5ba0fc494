//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/pulsekit/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/pulsekit/` (~/.config/pulsekit/)
//! - Data: `$XDG_DATA_HOME/pulsekit/` (~/.local/share/pulsekit/)
//! - State/Logs: `$XDG_STATE_HOME/pulsekit/` (~/.local/state/pulsekit/)

use crate::error::{Error, Result};
use crate::types::Feature;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collection endpoint and request signing
    #[serde(default)]
    pub server: ServerConfig,

    /// Request store capacity and delivery policy
    #[serde(default)]
    pub queue: QueueConfig,

    /// Input limits applied to events and crash breadcrumbs
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session tracking
    #[serde(default)]
    pub session: SessionConfig,

    /// Consent requirements and initial grants
    #[serde(default)]
    pub consent: ConsentConfig,

    /// Static metrics sent with every begin-session request
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Initial location
    #[serde(default)]
    pub location: LocationConfig,

    /// Server-provided configuration
    #[serde(default)]
    pub remote_config: RemoteConfigConfig,
}

/// Collection endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the collection server (e.g., `https://analytics.example.com`)
    pub url: Option<String>,

    /// Application key issued by the server
    pub app_key: Option<String>,

    /// Developer-provided device id. A random id is generated when unset.
    pub device_id: Option<String>,

    /// Salt appended before hashing request checksums
    pub salt: Option<String>,

    /// Always send requests as POST
    #[serde(default)]
    pub enable_post: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            app_key: None,
            device_id: None,
            salt: None,
            enable_post: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Check if the server section has everything needed to build requests
    pub fn is_ready(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
            && self.app_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::Config("server.url is required".to_string()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::Config(format!(
                "server.url must start with http:// or https://, got {url}"
            )));
        }
        if self.app_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(Error::Config("server.app_key is required".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "server.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Server URL without a trailing slash
    pub fn base_url(&self) -> Result<String> {
        self.url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| Error::Config("server.url is required".to_string()))
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// What the drain loop does with a request that failed every attempt
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryExhaustion {
    /// Drop the request and continue with the next one
    #[default]
    Drop,
    /// Keep the request at the head and stop until the next trigger
    Halt,
}

/// Request store and delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum number of persisted requests; the oldest is evicted beyond this
    #[serde(default = "default_stored_request_limit")]
    pub stored_request_limit: usize,

    /// Events buffered per queue before an automatic flush
    #[serde(default = "default_event_queue_threshold")]
    pub event_queue_threshold: usize,

    /// Total send attempts for the head request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts on the same request
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Delay between consecutive sends
    #[serde(default = "default_request_pacing_ms")]
    pub request_pacing_ms: u64,

    /// Policy once `max_retries` attempts have failed
    #[serde(default)]
    pub on_retry_exhausted: RetryExhaustion,

    /// Only deliver when asked to explicitly
    #[serde(default)]
    pub manual_dispatch: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stored_request_limit: default_stored_request_limit(),
            event_queue_threshold: default_event_queue_threshold(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_pacing_ms: default_request_pacing_ms(),
            on_retry_exhausted: RetryExhaustion::default(),
            manual_dispatch: false,
        }
    }
}

impl QueueConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_pacing(&self) -> Duration {
        Duration::from_millis(self.request_pacing_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.stored_request_limit == 0 {
            return Err(Error::Config(
                "queue.stored_request_limit must be at least 1".to_string(),
            ));
        }
        if self.event_queue_threshold == 0 {
            return Err(Error::Config(
                "queue.event_queue_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config(
                "queue.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_stored_request_limit() -> usize {
    1000
}

fn default_event_queue_threshold() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_request_pacing_ms() -> u64 {
    100
}

/// Input limits
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Maximum length of event keys and segmentation keys
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    /// Maximum length of string segmentation values
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,

    /// Maximum number of segmentation entries per event
    #[serde(default = "default_max_segmentation_values")]
    pub max_segmentation_values: usize,

    /// Maximum number of crash breadcrumbs kept
    #[serde(default = "default_max_breadcrumbs")]
    pub max_breadcrumbs: usize,

    /// Maximum length of a single breadcrumb
    #[serde(default = "default_max_breadcrumb_length")]
    pub max_breadcrumb_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_length: default_max_key_length(),
            max_value_size: default_max_value_size(),
            max_segmentation_values: default_max_segmentation_values(),
            max_breadcrumbs: default_max_breadcrumbs(),
            max_breadcrumb_length: default_max_breadcrumb_length(),
        }
    }
}

fn default_max_key_length() -> usize {
    128
}

fn default_max_value_size() -> usize {
    256
}

fn default_max_segmentation_values() -> usize {
    100
}

fn default_max_breadcrumbs() -> usize {
    100
}

fn default_max_breadcrumb_length() -> usize {
    1000
}

/// Session tracking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Begin a session on startup and extend it on a timer
    #[serde(default = "default_automatic_tracking")]
    pub automatic_tracking: bool,

    /// Seconds between session extensions
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            automatic_tracking: default_automatic_tracking(),
            duration_secs: default_session_duration(),
        }
    }
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs.max(1))
    }
}

fn default_automatic_tracking() -> bool {
    true
}

fn default_session_duration() -> u64 {
    60
}

/// Consent configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConsentConfig {
    /// Features stay disabled until consent is given
    #[serde(default)]
    pub required: bool,

    /// Features consented to at startup
    #[serde(default)]
    pub given: Vec<Feature>,

    /// Named feature groups
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<Feature>>,

    /// Groups consented to at startup
    #[serde(default)]
    pub given_groups: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Location sent with session begin
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocationConfig {
    pub country_code: Option<String>,
    pub city: Option<String>,
    /// "latitude,longitude"
    pub gps: Option<String>,
    pub ip: Option<String>,
    /// Tell the server not to resolve a location for this device
    #[serde(default)]
    pub disabled: bool,
}

/// Remote config configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RemoteConfigConfig {
    /// Fetch once in the background when the context starts
    #[serde(default)]
    pub fetch_on_start: bool,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate every section needed to run the SDK
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.queue.validate()?;
        for group in &self.consent.given_groups {
            if !self.consent.groups.contains_key(group) {
                return Err(Error::Config(format!(
                    "consent.given_groups references unknown group {group:?}"
                )));
            }
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/pulsekit/config.toml` (~/.config/pulsekit/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("pulsekit").join("config.toml")
    }

    /// Returns the data directory path (for the request store)
    ///
    /// `$XDG_DATA_HOME/pulsekit/` (~/.local/share/pulsekit/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("pulsekit")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/pulsekit/` (~/.local/state/pulsekit/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("pulsekit")
    }

    /// Returns the request store path
    ///
    /// `$XDG_DATA_HOME/pulsekit/queue.db` (~/.local/share/pulsekit/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/pulsekit/pulsekit.log` (~/.local/state/pulsekit/pulsekit.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("pulsekit.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.stored_request_limit, 1000);
        assert_eq!(config.queue.event_queue_threshold, 100);
        assert_eq!(config.queue.on_retry_exhausted, RetryExhaustion::Drop);
        assert_eq!(config.session.duration_secs, 60);
        assert!(config.session.automatic_tracking);
        assert!(!config.consent.required);
        assert!(!config.remote_config.fetch_on_start);
        assert!(!config.server.is_ready());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
url = "https://analytics.example.com/"
app_key = "abc123"
salt = "pepper"
enable_post = true

[queue]
stored_request_limit = 50
on_retry_exhausted = "halt"

[consent]
required = true
given = ["sessions", "star-rating"]
given_groups = ["core"]

[consent.groups]
core = ["events", "views"]

[metrics]
_os = "Linux"

[logging]
level = "debug"

[remote_config]
fetch_on_start = true
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.server.base_url().unwrap(),
            "https://analytics.example.com"
        );
        assert!(config.server.enable_post);
        assert_eq!(config.queue.stored_request_limit, 50);
        assert_eq!(config.queue.on_retry_exhausted, RetryExhaustion::Halt);
        assert_eq!(
            config.consent.given,
            vec![Feature::Sessions, Feature::StarRating]
        );
        assert_eq!(
            config.consent.groups["core"],
            vec![Feature::Events, Feature::Views]
        );
        assert_eq!(config.metrics["_os"], "Linux");
        assert_eq!(config.logging.level, "debug");
        assert!(config.remote_config.fetch_on_start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_validation() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.url = Some("analytics.example.com".to_string());
        config.server.app_key = Some("key".to_string());
        assert!(config.validate().is_err());

        config.server.url = Some("http://analytics.example.com".to_string());
        assert!(config.validate().is_ok());
        assert!(config.server.is_ready());

        config.server.app_key = Some("   ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_validation() {
        let mut config = Config::default();
        config.server.url = Some("http://localhost".to_string());
        config.server.app_key = Some("key".to_string());

        config.queue.stored_request_limit = 0;
        assert!(config.validate().is_err());

        config.queue.stored_request_limit = 1;
        config.queue.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_given_group_rejected() {
        let toml = r#"
[server]
url = "http://localhost"
app_key = "key"

[consent]
required = true
given_groups = ["missing"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_feature_fails_to_parse() {
        let toml = r#"
[consent]
given = ["telepathy"]
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
