// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable session rows.
//!
//! The gateway's in-memory registry is the authority for transient state
//! (active runs); these rows are the durable remainder: identity, counters,
//! the provider-assigned external id.  Rows are written on create and on
//! counter updates and are never deleted by the core.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Store;

/// One persisted session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: i64,
    pub session_key: String,
    pub external_id: Option<String>,
    pub message_count: i64,
    pub last_message_at: Option<i64>,
    pub created_at: i64,
}

impl Store {
    /// Insert the session row if the key is unknown; return the row either
    /// way.  `INSERT OR IGNORE` on the unique key makes concurrent calls
    /// converge on one row.
    pub fn upsert_session(&self, session_key: &str) -> crate::Result<SessionRow> {
        {
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO sessions (session_key, created_at) VALUES (?1, ?2)",
            )?;
            stmt.execute(params![session_key, Self::now()])?;
        }
        self.load_session(session_key)?
            .ok_or_else(|| rusqlite::Error::QueryReturnedNoRows.into())
    }

    pub fn load_session(&self, session_key: &str) -> crate::Result<Option<SessionRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_key, external_id, message_count, last_message_at, created_at
             FROM sessions WHERE session_key = ?1",
        )?;
        Ok(stmt
            .query_row(params![session_key], row_to_session)
            .optional()?)
    }

    pub fn list_sessions(&self) -> crate::Result<Vec<SessionRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_key, external_id, message_count, last_message_at, created_at
             FROM sessions ORDER BY session_key",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Record the provider-assigned identifier once it is learned from a
    /// terminal agent event.
    pub fn set_session_external_id(
        &self,
        session_key: &str,
        external_id: &str,
    ) -> crate::Result<()> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("UPDATE sessions SET external_id = ?2 WHERE session_key = ?1")?;
        stmt.execute(params![session_key, external_id])?;
        Ok(())
    }

    /// Bump the message counter and `last_message_at`.
    pub fn increment_session_messages(&self, session_key: &str) -> crate::Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "UPDATE sessions
             SET message_count = message_count + 1, last_message_at = ?2
             WHERE session_key = ?1",
        )?;
        stmt.execute(params![session_key, Self::now()])?;
        Ok(())
    }

    /// Store one conversation message (user turn text, terminal payloads).
    pub fn record_message(
        &self,
        session_key: &str,
        role: &str,
        content: &str,
    ) -> crate::Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO messages (session_key, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![session_key, role, content, Self::now()])?;
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        session_key: row.get(1)?,
        external_id: row.get(2)?,
        message_count: row.get(3)?,
        last_message_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
