//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Each migration runs in its own transaction together with the version
//! bump, so an interrupted migration leaves the old version in place and is
//! retried on the next open.

use crate::error::{Error, Result};
use crate::request::builder::{resign_url, sign_body};
use crate::request::Request;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, Transaction};
use serde::Deserialize;
use serde_json::Value;

use super::store::insert_request;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Inputs for migrations that rewrite stored requests
#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    /// Salt used to re-sign converted requests
    pub salt: Option<String>,
}

enum Migration {
    Sql(&'static str),
    Rust(fn(&Transaction<'_>, &MigrationContext) -> Result<()>),
}

/// Migrations, indexed by version number
const MIGRATIONS: &[Migration] = &[
    // Version 1: legacy layout, one JSON document per request
    Migration::Sql(
        r#"
        CREATE TABLE IF NOT EXISTS request_entities (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            json             TEXT NOT NULL
        );
        "#,
    ),
    // Version 2: typed request columns plus settings
    Migration::Rust(convert_legacy_requests),
];

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection, ctx: &MigrationContext) -> Result<()> {
    run_migrations_to(conn, SCHEMA_VERSION, ctx)
}

fn run_migrations_to(conn: &mut Connection, target: i32, ctx: &MigrationContext) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = target,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version <= current_version || version > target {
            continue;
        }

        tracing::info!(version, "Running migration");
        let tx = conn.transaction()?;
        let applied = match migration {
            Migration::Sql(sql) => tx.execute_batch(sql).map_err(Error::from),
            Migration::Rust(apply) => apply(&tx, ctx),
        };
        applied.map_err(|e| Error::Migration {
            version,
            message: e.to_string(),
        })?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    if current_version < target {
        tracing::info!(from = current_version, to = target, "Migrations complete");
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

/// Legacy request document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyRequest {
    #[serde(default)]
    is_request_get_type: bool,
    request_url: Option<String>,
    request_data: Option<String>,
    request_date_time: Option<String>,
}

fn convert_legacy_requests(tx: &Transaction<'_>, ctx: &MigrationContext) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            is_get           INTEGER NOT NULL,
            url              TEXT,
            body             TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key              TEXT PRIMARY KEY,
            value            TEXT NOT NULL
        );
        "#,
    )?;

    let legacy: Vec<(i64, String)> = {
        let mut stmt = tx.prepare("SELECT id, json FROM request_entities ORDER BY id")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut converted = 0usize;
    let mut skipped = 0usize;
    for (id, json) in &legacy {
        match convert_legacy(*id, json, ctx.salt.as_deref()) {
            Some(request) => {
                insert_request(tx, &request)?;
                converted += 1;
            }
            None => skipped += 1,
        }
    }

    tx.execute("DROP TABLE request_entities", [])?;

    if !legacy.is_empty() {
        tracing::info!(converted, skipped, "Converted legacy requests");
    }
    Ok(())
}

fn convert_legacy(id: i64, json: &str, salt: Option<&str>) -> Option<Request> {
    let legacy: LegacyRequest = match serde_json::from_str(json) {
        Ok(legacy) => legacy,
        Err(e) => {
            tracing::warn!(id, error = %e, "Dropping unreadable legacy request");
            return None;
        }
    };

    let mut request = if legacy.is_request_get_type {
        let Some(url) = legacy.request_url.filter(|u| !u.is_empty()) else {
            tracing::warn!(id, "Dropping legacy GET request without url");
            return None;
        };
        Request::get(resign_url(&url, salt))
    } else {
        let Some(data) = legacy.request_data.filter(|d| !d.is_empty()) else {
            tracing::warn!(id, "Dropping legacy POST request without body");
            return None;
        };
        match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(map)) => Request::post(sign_body(map, salt)),
            _ => {
                tracing::warn!(id, "Legacy POST body is not a JSON object, kept unsigned");
                Request::post(data)
            }
        }
    };

    if let Some(created_at) = legacy.request_date_time.as_deref().and_then(parse_legacy_time) {
        request.created_at = created_at;
    }
    Some(request)
}

fn parse_legacy_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
