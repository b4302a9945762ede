// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Append-only stream-event log.
//!
//! `seq` is the table's `INTEGER PRIMARY KEY AUTOINCREMENT`: SQLite
//! guarantees it is strictly increasing over the lifetime of the table and
//! never reused, even after rows are deleted.  It is the sole ordering
//! primitive — per-session order and the cross-session total order are both
//! just `ORDER BY seq`.
//!
//! Cursor semantics are *strictly-after*: `after_seq = k` excludes `seq = k`.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Store;

/// The closed set of stream event types. `data` payloads are opaque to the
/// core; only the type tag is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEventKind {
    /// Incremental output delta.
    #[serde(rename = "agent.stream")]
    Stream,
    /// The producer wants to invoke a tool.
    #[serde(rename = "agent.tool_use_request")]
    ToolUseRequest,
    /// Outcome of a tool invocation (including refusals, `denied: true`).
    #[serde(rename = "agent.tool_use_result")]
    ToolUseResult,
    /// A tool invocation is waiting on an approval decision.
    #[serde(rename = "agent.approval_request")]
    ApprovalRequest,
    /// Terminal: the run finished.
    #[serde(rename = "agent.result")]
    Result,
    /// Terminal: the run failed or was aborted.
    #[serde(rename = "agent.error")]
    Error,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "agent.stream",
            Self::ToolUseRequest => "agent.tool_use_request",
            Self::ToolUseResult => "agent.tool_use_result",
            Self::ApprovalRequest => "agent.approval_request",
            Self::Result => "agent.result",
            Self::Error => "agent.error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent.stream" => Some(Self::Stream),
            "agent.tool_use_request" => Some(Self::ToolUseRequest),
            "agent.tool_use_result" => Some(Self::ToolUseResult),
            "agent.approval_request" => Some(Self::ApprovalRequest),
            "agent.result" => Some(Self::Result),
            "agent.error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Terminal events end a run; there is exactly one per run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result | Self::Error)
    }
}

/// One appended record. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub seq: i64,
    pub session_key: String,
    pub kind: StreamEventKind,
    pub data: String,
    pub created_at: i64,
}

/// Per-session replay position: deliver events with `seq > after_seq` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub session_key: String,
    pub after_seq: i64,
}

impl Cursor {
    pub fn new(session_key: impl Into<String>, after_seq: i64) -> Self {
        Self {
            session_key: session_key.into(),
            after_seq,
        }
    }
}

impl Store {
    /// Append one event and return its assigned `seq`.
    ///
    /// Succeeds for session keys that were never registered — the log does
    /// not depend on the session table.
    pub fn append_event(
        &self,
        session_key: &str,
        kind: StreamEventKind,
        data: &str,
    ) -> crate::Result<i64> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO stream_events (session_key, event_type, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![session_key, kind.as_str(), data, Self::now()])?;
        Ok(conn.last_insert_rowid())
    }

    /// Return up to `limit` events matching any cursor, strictly ordered by
    /// `seq` ascending.
    ///
    /// One scan, one disjunction — SQL yields each row at most once no
    /// matter how many cursor branches match it.  Pagination: call again
    /// with advanced cursors until the returned count is < `limit`.
    pub fn query_by_cursors(
        &self,
        cursors: &[Cursor],
        limit: usize,
    ) -> crate::Result<Vec<StreamEvent>> {
        if cursors.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT seq, session_key, event_type, data, created_at
             FROM stream_events WHERE ",
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(cursors.len() * 2 + 1);
        for (i, cursor) in cursors.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            let base = i * 2;
            sql.push_str(&format!(
                "(session_key = ?{} AND seq > ?{})",
                base + 1,
                base + 2
            ));
            values.push(cursor.session_key.clone().into());
            values.push(cursor.after_seq.into());
        }
        sql.push_str(&format!(
            " ORDER BY seq ASC LIMIT ?{}",
            cursors.len() * 2 + 1
        ));
        values.push((limit as i64).into());

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
            let kind_str: String = row.get(2)?;
            Ok(StreamEvent {
                seq: row.get(0)?,
                session_key: row.get(1)?,
                // Unknown tags cannot appear: only this module writes the column.
                kind: StreamEventKind::parse(&kind_str).unwrap_or(StreamEventKind::Error),
                data: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// The highest `seq` ever assigned, or 0 for an empty log.
    pub fn max_seq(&self) -> crate::Result<i64> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT COALESCE(MAX(seq), 0) FROM stream_events")?;
        Ok(stmt.query_row([], |r| r.get(0))?)
    }

    /// Remove all events for one session key (explicit session wipe).
    pub fn delete_events_for_session(&self, session_key: &str) -> crate::Result<usize> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("DELETE FROM stream_events WHERE session_key = ?1")?;
        Ok(stmt.execute(params![session_key])?)
    }

    /// Remove acknowledged events for a session below a high-water mark
    /// (inclusive).
    pub fn delete_events_up_to(&self, session_key: &str, max_seq: i64) -> crate::Result<usize> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "DELETE FROM stream_events WHERE session_key = ?1 AND seq <= ?2",
        )?;
        Ok(stmt.execute(params![session_key, max_seq])?)
    }

    /// Remove events older than `max_age_secs`.
    pub fn sweep_events(&self, max_age_secs: u64) -> crate::Result<usize> {
        self.sweep_events_with_floor(max_age_secs, i64::MAX)
    }

    /// Shift every event's `created_at` by `delta_secs`. Test support for
    /// exercising retention without waiting out the horizon.
    #[doc(hidden)]
    pub fn shift_event_timestamps(&self, delta_secs: i64) -> crate::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE stream_events SET created_at = created_at + ?1",
            params![delta_secs],
        )?;
        Ok(())
    }

    /// Remove events older than `max_age_secs`, but never events with
    /// `seq > min_acked_seq` — a slow but attached reader keeps its tail.
    pub fn sweep_events_with_floor(
        &self,
        max_age_secs: u64,
        min_acked_seq: i64,
    ) -> crate::Result<usize> {
        let horizon = Self::now() - max_age_secs as i64;
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "DELETE FROM stream_events WHERE created_at < ?1 AND seq <= ?2",
        )?;
        let removed = stmt.execute(params![horizon, min_acked_seq])?;
        if removed > 0 {
            debug!(removed, horizon, "swept aged stream events");
        }
        Ok(removed)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Store {
        Store::open_in_memory().unwrap()
    }

    // ── Append / seq ──────────────────────────────────────────────────────────

    #[test]
    fn append_assigns_increasing_seq() {
        let s = log();
        let a = s.append_event("A", StreamEventKind::Stream, "1").unwrap();
        let b = s.append_event("B", StreamEventKind::Stream, "2").unwrap();
        let c = s.append_event("A", StreamEventKind::Result, "3").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn append_does_not_require_registered_session() {
        let s = log();
        assert!(s
            .append_event("never:seen:key", StreamEventKind::Stream, "x")
            .is_ok());
    }

    #[test]
    fn seq_stays_monotonic_after_deletes() {
        let s = log();
        let a = s.append_event("A", StreamEventKind::Stream, "1").unwrap();
        s.delete_events_for_session("A").unwrap();
        let b = s.append_event("A", StreamEventKind::Stream, "2").unwrap();
        assert!(b > a, "AUTOINCREMENT must not reuse {a}");
    }

    // ── Cursor queries ────────────────────────────────────────────────────────

    #[test]
    fn empty_cursor_list_returns_empty() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "1").unwrap();
        assert!(s.query_by_cursors(&[], 100).unwrap().is_empty());
    }

    #[test]
    fn interleaved_two_session_replay_is_seq_ordered() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "a1").unwrap();
        s.append_event("B", StreamEventKind::Stream, "b1").unwrap();
        s.append_event("A", StreamEventKind::Result, "a2").unwrap();

        let rows = s
            .query_by_cursors(&[Cursor::new("A", 0), Cursor::new("B", 0)], 10)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn cursor_is_strictly_after() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "a1").unwrap();
        s.append_event("B", StreamEventKind::Stream, "b1").unwrap();
        s.append_event("A", StreamEventKind::Result, "a2").unwrap();

        let rows = s
            .query_by_cursors(&[Cursor::new("A", 1), Cursor::new("B", 0)], 10)
            .unwrap();
        assert_eq!(
            rows.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3],
            "after_seq = 1 must exclude seq = 1"
        );
    }

    #[test]
    fn duplicate_cursor_keys_do_not_duplicate_rows() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "a1").unwrap();
        let rows = s
            .query_by_cursors(&[Cursor::new("A", 0), Cursor::new("A", 0)], 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn limit_pages_and_cursor_advance_drains() {
        let s = log();
        for i in 0..5 {
            s.append_event("A", StreamEventKind::Stream, &format!("{i}"))
                .unwrap();
        }

        let mut after = 0;
        let mut seen = Vec::new();
        loop {
            let page = s.query_by_cursors(&[Cursor::new("A", after)], 2).unwrap();
            let n = page.len();
            for e in page {
                after = e.seq;
                seen.push(e.seq);
            }
            if n < 2 {
                break;
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn cursor_above_max_yields_nothing() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "a1").unwrap();
        let rows = s.query_by_cursors(&[Cursor::new("A", 999)], 10).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn unsubscribed_sessions_are_not_returned() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "a1").unwrap();
        s.append_event("B", StreamEventKind::Stream, "b1").unwrap();
        let rows = s.query_by_cursors(&[Cursor::new("A", 0)], 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_key, "A");
    }

    // ── Deletion / sweep ──────────────────────────────────────────────────────

    #[test]
    fn delete_up_to_is_inclusive() {
        let s = log();
        for _ in 0..3 {
            s.append_event("A", StreamEventKind::Stream, "x").unwrap();
        }
        s.delete_events_up_to("A", 2).unwrap();
        let rows = s.query_by_cursors(&[Cursor::new("A", 0)], 10).unwrap();
        assert_eq!(rows.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn sweep_ignores_fresh_events() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "x").unwrap();
        let removed = s.sweep_events(3600).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn sweep_removes_aged_events_up_to_floor() {
        let s = log();
        s.append_event("A", StreamEventKind::Stream, "old1").unwrap();
        s.append_event("A", StreamEventKind::Stream, "old2").unwrap();
        // Backdate both rows past the horizon.
        s.shift_event_timestamps(-7200).unwrap();

        // Floor at seq 1: the unacked seq 2 must survive even though aged.
        let removed = s.sweep_events_with_floor(3600, 1).unwrap();
        assert_eq!(removed, 1);
        let rows = s.query_by_cursors(&[Cursor::new("A", 0)], 10).unwrap();
        assert_eq!(rows.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2]);
    }

    // ── Kind round trip ───────────────────────────────────────────────────────

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            StreamEventKind::Stream,
            StreamEventKind::ToolUseRequest,
            StreamEventKind::ToolUseResult,
            StreamEventKind::ApprovalRequest,
            StreamEventKind::Result,
            StreamEventKind::Error,
        ] {
            assert_eq!(StreamEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StreamEventKind::parse("agent.bogus"), None);
    }

    #[test]
    fn only_result_and_error_are_terminal() {
        assert!(StreamEventKind::Result.is_terminal());
        assert!(StreamEventKind::Error.is_terminal());
        assert!(!StreamEventKind::Stream.is_terminal());
        assert!(!StreamEventKind::ApprovalRequest.is_terminal());
    }
}
