//! pulsekit - operator tool for the analytics request queue
//!
//! This tool provides commands for:
//! - Checking configuration and queue status
//! - Listing and clearing pending requests
//! - Draining the queue to the collection server
//! - Recording a one-off event through the full SDK path
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/pulsekit/queue.db (~/.local/share/pulsekit/queue.db)
//! - Config: $XDG_CONFIG_HOME/pulsekit/config.toml (~/.config/pulsekit/config.toml)

mod process_lock;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulsekit_core::db::MigrationContext;
use pulsekit_core::device::DeviceIdentity;
use pulsekit_core::dispatch::{DispatchPolicy, Dispatcher, HttpTransport};
use pulsekit_core::{Analytics, Config, CustomEvent, RequestStore};
use serde_json::Value;

use crate::process_lock::acquire_drain_guard;

#[derive(Parser)]
#[command(name = "pulsekit")]
#[command(about = "Inspect and drain the pulsekit analytics request queue")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, schema version and queue size
    Status,

    /// List pending requests, oldest first
    Queue {
        /// Show at most this many requests
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Deliver pending requests to the configured server
    Drain,

    /// Run store migrations and print the schema version
    Migrate,

    /// Delete every pending request
    Clear,

    /// Record one event and persist it to the queue
    Event {
        /// Event key
        key: String,

        /// Segmentation entry as key=value (repeatable)
        #[arg(short, long = "segment", value_name = "KEY=VALUE")]
        segments: Vec<String>,

        /// Event count
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// Event sum
        #[arg(long)]
        sum: Option<f64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(pulsekit_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Queue { limit } => cmd_queue(&config, limit),
        Command::Drain => cmd_drain(&config),
        Command::Migrate => cmd_migrate(&config),
        Command::Clear => cmd_clear(&config),
        Command::Event {
            key,
            segments,
            count,
            sum,
        } => cmd_event(&config, key, &segments, count, sum),
    }
}

/// Open the store at the default path and bring its schema up to date
fn open_store(config: &Config) -> Result<RequestStore> {
    let db_path = Config::database_path();
    let store = RequestStore::open(&db_path, config.queue.stored_request_limit)
        .with_context(|| format!("failed to open request store at {}", db_path.display()))?;
    store
        .migrate(&migration_context(config))
        .context("failed to run store migrations")?;
    Ok(store)
}

fn migration_context(config: &Config) -> MigrationContext {
    MigrationContext {
        salt: config.server.salt.clone().filter(|s| !s.is_empty()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("pulsekit Status");
    println!("===============");
    println!();

    let server = &config.server;
    println!("Server URL:      {}", server.url.as_deref().unwrap_or("(not set)"));
    println!(
        "App key:         {}",
        if server.app_key.is_some() { "set" } else { "(not set)" }
    );
    println!("Signed:          {}", server.salt.is_some());
    println!("Force POST:      {}", server.enable_post);
    println!("Ready:           {}", server.is_ready());
    println!();

    let queue = &config.queue;
    println!("Request limit:   {}", queue.stored_request_limit);
    println!("Event threshold: {}", queue.event_queue_threshold);
    println!("Max retries:     {}", queue.max_retries);
    println!("On exhaustion:   {:?}", queue.on_retry_exhausted);
    println!("Consent needed:  {}", config.consent.required);
    println!();

    let db_path = Config::database_path();
    println!("Database:        {}", db_path.display());
    if !db_path.exists() {
        println!("Store:           not created yet");
        return Ok(());
    }

    let store = open_store(config)?;
    println!("Schema version:  {}", store.schema_version()?);
    println!("Pending:         {}", store.count()?);
    match DeviceIdentity::stored(&store)? {
        Some(device) => println!("Device id:       {} ({})", device.id, device.kind.as_str()),
        None => println!("Device id:       (not assigned)"),
    }

    Ok(())
}

fn cmd_queue(config: &Config, limit: Option<usize>) -> Result<()> {
    let store = open_store(config)?;
    let records = store.models().context("failed to list requests")?;
    let total = records.len();

    println!("{} pending request(s)", total);
    for record in records.iter().take(limit.unwrap_or(total)) {
        let (method, data) = if record.is_get {
            ("GET ", record.url.as_deref().unwrap_or("<missing url>"))
        } else {
            ("POST", record.body.as_deref().unwrap_or("<missing body>"))
        };
        println!(
            "  #{:<6} {} {} {}",
            record.id,
            record.created_at,
            method,
            preview(data, 96)
        );
    }
    if let Some(limit) = limit {
        if total > limit {
            println!("  ... {} more", total - limit);
        }
    }
    Ok(())
}

fn preview(data: &str, max: usize) -> String {
    if data.chars().count() <= max {
        return data.to_string();
    }
    let mut cut: String = data.chars().take(max).collect();
    cut.push_str("...");
    cut
}

fn cmd_drain(config: &Config) -> Result<()> {
    config
        .server
        .validate()
        .context("server configuration is incomplete")?;

    let db_path = Config::database_path();
    let _guard = acquire_drain_guard(&db_path).context("failed to acquire drain lock")?;

    let store = Arc::new(open_store(config)?);
    let pending = store.count()?;
    if pending == 0 {
        println!("Queue is empty, nothing to send.");
        return Ok(());
    }

    let transport = Arc::new(HttpTransport::new(&config.server).context("failed to create HTTP transport")?);
    println!("Draining {} request(s) to {}", pending, transport.endpoint());

    let rt = runtime()?;
    let dispatcher = Dispatcher::new(
        store.clone(),
        transport,
        DispatchPolicy::from(&config.queue),
        rt.handle().clone(),
    );
    let report = rt
        .block_on(dispatcher.drain())
        .context("a drain is already running")?;

    let remaining = store.count()?;
    tracing::info!(
        sent = report.sent,
        dropped = report.dropped,
        halted = report.halted,
        remaining,
        "Operator drain finished"
    );
    println!();
    println!("Drain Results:");
    println!("  Sent:      {}", report.sent);
    println!("  Dropped:   {}", report.dropped);
    println!("  Remaining: {}", remaining);

    if report.halted {
        anyhow::bail!(
            "delivery failed after {} attempt(s); {} request(s) kept for the next drain",
            config.queue.max_retries.max(1),
            remaining
        );
    }
    Ok(())
}

fn cmd_migrate(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    println!("Schema version: {}", store.schema_version()?);
    println!("Pending requests: {}", store.count()?);
    Ok(())
}

fn cmd_clear(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let cleared = store.clear().context("failed to clear requests")?;
    println!("Cleared {} request(s)", cleared);
    Ok(())
}

fn cmd_event(
    config: &Config,
    key: String,
    segments: &[String],
    count: u32,
    sum: Option<f64>,
) -> Result<()> {
    // Persist only; delivery is left to `pulsekit drain`
    let mut config = config.clone();
    config.queue.manual_dispatch = true;
    config.session.automatic_tracking = false;

    let mut event = CustomEvent::new(key.clone()).count(count);
    if let Some(sum) = sum {
        event = event.sum(sum);
    }
    for segment in segments {
        let (k, v) = segment
            .split_once('=')
            .with_context(|| format!("segment {segment:?} is not key=value"))?;
        event = event.segment(k, parse_segment_value(v));
    }

    let rt = runtime()?;
    let _enter = rt.enter();
    let store = Arc::new(open_store(&config)?);
    let analytics = Analytics::builder(config)
        .store(store)
        .build()
        .context("failed to start analytics")?;

    if !analytics.record_event(event) {
        anyhow::bail!("event {key:?} was not recorded (check the key and events consent)");
    }
    analytics.shutdown();

    println!("Recorded event {key:?}");
    println!("Pending requests: {}", analytics.pending_requests()?);
    Ok(())
}

/// Numbers and booleans keep their type; anything else is a string
fn parse_segment_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_value() {
        assert_eq!(parse_segment_value("3"), Value::from(3));
        assert_eq!(parse_segment_value("true"), Value::Bool(true));
        assert_eq!(parse_segment_value("pro"), Value::from("pro"));
        assert_eq!(parse_segment_value("[1]"), Value::from("[1]"));
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("abc", 5), "abc");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
