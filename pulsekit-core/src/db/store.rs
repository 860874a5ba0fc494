//! Durable request store
//!
//! An ordered, capacity-bounded collection of pending requests backed by
//! SQLite. Every mutation is committed before it returns.

use crate::error::Result;
use crate::request::{Request, RequestRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::schema::{self, MigrationContext};

/// Persistent FIFO of outbound requests
pub struct RequestStore {
    conn: Mutex<Connection>,
    limit: usize,
}

impl RequestStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path, limit: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // A committed mutation must be on disk before it returns
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            limit: limit.max(1),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(limit: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            limit: limit.max(1),
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self, ctx: &MigrationContext) -> Result<()> {
        let mut conn = self.conn();
        schema::run_migrations(&mut conn, ctx)
    }

    pub fn schema_version(&self) -> Result<i32> {
        schema::get_schema_version(&self.conn())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Request operations
    // ============================================

    /// Append a request, evicting the oldest ones if the store is full.
    ///
    /// Eviction does not know about the drain loop. A head that is being
    /// sent when it is evicted may still reach the server once; the loop's
    /// later [`remove`](Self::remove) then returns `Ok(false)`. Every other
    /// evicted request is gone for good.
    ///
    /// Returns the id assigned to the new request.
    pub fn enqueue(&self, request: &Request) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM requests", [], |r| r.get(0))?;
        let overflow = count - self.limit as i64 + 1;
        if overflow > 0 {
            let evicted = tx.execute(
                "DELETE FROM requests WHERE id IN (SELECT id FROM requests ORDER BY id LIMIT ?1)",
                params![overflow],
            )?;
            tracing::warn!(
                evicted,
                limit = self.limit,
                "Request store full, dropped oldest requests"
            );
        }

        let id = insert_request(&tx, request)?;
        tx.commit()?;
        Ok(id)
    }

    /// Oldest request without removing it
    pub fn peek(&self) -> Result<Option<RequestRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, is_get, url, body, created_at FROM requests ORDER BY id LIMIT 1",
            [],
            Self::row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Remove and return the oldest request
    pub fn dequeue(&self) -> Result<Option<RequestRecord>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let head = tx
            .query_row(
                "SELECT id, is_get, url, body, created_at FROM requests ORDER BY id LIMIT 1",
                [],
                Self::row_to_record,
            )
            .optional()?;
        if let Some(record) = &head {
            tx.execute("DELETE FROM requests WHERE id = ?1", params![record.id])?;
        }
        tx.commit()?;
        Ok(head)
    }

    /// Remove one specific request. Returns false if it was already gone.
    pub fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM requests WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Drop every pending request. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM requests", [])?)
    }

    /// Ordered snapshot of all pending requests
    pub fn models(&self) -> Result<Vec<RequestRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, is_get, url, body, created_at FROM requests ORDER BY id")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize> {
        Ok(self.conn().execute(sql, [])?)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<RequestRecord> {
        Ok(RequestRecord {
            id: row.get(0)?,
            is_get: row.get(1)?,
            url: row.get(2)?,
            body: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    // ============================================
    // Settings
    // ============================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Returns false if the key was not set
    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }
}

/// Insert a request row and return its id
pub(crate) fn insert_request(conn: &Connection, request: &Request) -> rusqlite::Result<i64> {
    let record = RequestRecord::encode(0, request);
    conn.execute(
        "INSERT INTO requests (is_get, url, body, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![record.is_get, record.url, record.body, record.created_at],
    )?;
    Ok(conn.last_insert_rowid())
}
