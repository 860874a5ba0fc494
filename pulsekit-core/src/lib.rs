//! # pulsekit-core
//!
//! Client-side product analytics: record events locally, persist them as
//! outbound requests and deliver them to a collection server in order.
//!
//! This library provides:
//! - A durable request store on SQLite with schema migrations
//! - Request building and signing for the collection endpoint
//! - Event batching, sessions, views, crashes and user profiles
//! - A consent gate in front of every producer
//! - A single-flight dispatch engine with bounded retries
//!
//! ## Architecture
//!
//! Producers go through the consent gate and either build a request directly
//! or buffer events that are flushed into one. Every request is committed to
//! the store before delivery is triggered; the dispatcher drains the store
//! head first and removes a request only once it was delivered (or its
//! retries ran out under the drop policy).
//!
//! ## Example
//!
//! ```rust,no_run
//! use pulsekit_core::{Analytics, Config, CustomEvent};
//!
//! # async fn run() -> pulsekit_core::Result<()> {
//! let config = Config::load()?;
//! let analytics = Analytics::builder(config).build()?;
//!
//! analytics.record_event(CustomEvent::new("purchase").sum(9.99).segment("plan", "pro"));
//! analytics.shutdown();
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use consent::{ConsentDelta, ConsentGate, ConsentListener};
pub use crash::CrashReport;
pub use db::RequestStore;
pub use dispatch::{DrainReport, DrainState, HttpTransport, Transport};
pub use error::{Error, Result};
pub use events::CustomEvent;
pub use location::Location;
pub use metrics::{MetricsProvider, StaticMetrics};
pub use remote_config::RemoteConfig;
pub use request::{Request, RequestRecord};
pub use sdk::{Analytics, AnalyticsBuilder, DeviceIdListener};
pub use types::*;
pub use user::{PropertyOp, UserDetails};

// Public modules
pub mod config;
pub mod consent;
pub mod crash;
pub mod db;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod location;
pub mod logging;
pub mod metrics;
pub mod remote_config;
pub mod request;
pub mod sdk;
pub mod session;
pub mod types;
pub mod user;

#[cfg(test)]
mod test_support;
