//! Database layer for pulsekit
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations, including conversion of legacy request documents
//! - The durable request store
//! - A small key/value settings table (device identity)

pub mod schema;
pub mod store;

pub use schema::{MigrationContext, SCHEMA_VERSION};
pub use store::RequestStore;
