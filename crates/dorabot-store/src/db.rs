// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Database handle and schema bootstrap.
//!
//! The store is opened **once per process** with write-ahead logging so
//! readers never block the single writer.  All statements go through
//! `prepare_cached`, so each SQL string is compiled exactly once per
//! connection.
//!
//! A `schema_version` table carries the migration counter; migrations are
//! applied in order inside one transaction on open.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

/// Storage failures. Callers map these onto the RPC `ErrPersistence` code;
/// they are never swallowed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current schema version. Bump together with a new entry in [`MIGRATIONS`].
const SCHEMA_VERSION: i64 = 1;

/// Ordered migrations; index + 1 is the version the step migrates *to*.
const MIGRATIONS: &[&str] = &[
    // v1 — initial schema.
    "
    CREATE TABLE IF NOT EXISTS sessions (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        session_key    TEXT NOT NULL UNIQUE,
        external_id    TEXT,
        message_count  INTEGER NOT NULL DEFAULT 0,
        last_message_at INTEGER,
        created_at     INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        session_key TEXT NOT NULL,
        role        TEXT NOT NULL,
        content     TEXT NOT NULL,
        created_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_key, id);

    CREATE TABLE IF NOT EXISTS stream_events (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_key TEXT NOT NULL,
        event_type  TEXT NOT NULL,
        data        TEXT NOT NULL,
        created_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_stream_events_session ON stream_events (session_key, seq);
    CREATE INDEX IF NOT EXISTS idx_stream_events_created ON stream_events (created_at);
    ",
];

/// Handle to the embedded SQL store.
///
/// One writer at a time: every operation locks the connection mutex for the
/// duration of its statement.  SQLite row operations are microseconds on a
/// local disk, so the mutex is never held across anything slow.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::bootstrap(conn)?;
        info!(db = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests. Same schema, no disk.
    pub fn open_in_memory() -> crate::Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> crate::Result<Self> {
        // WAL lets replay reads proceed while the supervisor appends.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        )?;

        let current: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap_or(0);

        if current < SCHEMA_VERSION {
            let tx_sql: String = MIGRATIONS[current as usize..]
                .iter()
                .copied()
                .collect::<Vec<_>>()
                .join("\n");
            conn.execute_batch(&format!("BEGIN;\n{tx_sql}\nCOMMIT;"))?;
            conn.execute("DELETE FROM schema_version", [])?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            info!(from = current, to = SCHEMA_VERSION, "schema migrated");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned mutex: the data in
    /// SQLite is consistent even if a panicking thread held the guard.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/dorabot.db");
        Store::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn schema_version_is_recorded() {
        let store = Store::open_in_memory().unwrap();
        let v: i64 = store
            .conn()
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(v, SCHEMA_VERSION);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dorabot.db");
        drop(Store::open(&path).unwrap());
        // Second open must not re-run migrations or error.
        Store::open(&path).unwrap();
    }
}
