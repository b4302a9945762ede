// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session registry — the authoritative map of sessions and the
//! single-writer lock for active runs.
//!
//! Sessions are created lazily on first reference and persisted on create
//! and on counter updates.  The in-memory map can be evicted per key
//! ([`SessionRegistry::remove`]); the persisted row and its events stay, so
//! history remains queryable.
//!
//! All mutations go through one mutex.  Acquiring the right to start a run
//! is a test-and-set on the `active` set under that mutex — the invariant
//! "at most one run per session" lives here and nowhere else.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use dorabot_store::{SessionRow, Store};

/// Identity of a conversation scope before key construction.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub channel: String,
    pub chat_type: String,
    pub chat_id: String,
}

/// Build the stable `channel:chat-type:chat-id` key. The chat id is
/// sanitized: path and separator characters become `_`, leading/trailing
/// underscores are trimmed.
pub fn make_key(desc: &SessionDescriptor) -> String {
    format!(
        "{}:{}:{}",
        desc.channel,
        desc.chat_type,
        sanitize_chat_id(&desc.chat_id)
    )
}

fn sanitize_chat_id(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c == ':' || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    replaced.trim_matches('_').to_string()
}

/// A session as reported to clients: the durable row plus the transient
/// active-run flag.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(flatten)]
    pub row: SessionRow,
    pub active_run: bool,
}

struct Inner {
    sessions: HashMap<String, SessionRow>,
    active: HashSet<String>,
}

pub struct SessionRegistry {
    store: Arc<Store>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                active: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the session for `key`, creating and persisting it if unknown.
    /// Idempotent under concurrent calls: the store insert is atomic on the
    /// unique key.
    pub fn get_or_create(&self, key: &str) -> crate::error::Result<SessionRow> {
        {
            let inner = self.lock();
            if let Some(row) = inner.sessions.get(key) {
                return Ok(row.clone());
            }
        }
        let row = self.store.upsert_session(key)?;
        let mut inner = self.lock();
        let entry = inner
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| row.clone());
        Ok(entry.clone())
    }

    /// Record the provider-assigned identifier learned from a terminal
    /// agent event.
    pub fn set_external_id(&self, key: &str, external_id: &str) -> crate::error::Result<()> {
        self.store.set_session_external_id(key, external_id)?;
        let mut inner = self.lock();
        if let Some(row) = inner.sessions.get_mut(key) {
            row.external_id = Some(external_id.to_string());
        }
        Ok(())
    }

    /// Bump the message counter and `last_message_at`.
    pub fn increment_messages(&self, key: &str) -> crate::error::Result<()> {
        self.store.increment_session_messages(key)?;
        let mut inner = self.lock();
        if let Some(row) = inner.sessions.get_mut(key) {
            row.message_count += 1;
            row.last_message_at = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }

    /// Atomically acquire the right to start a run on `key`. Returns false
    /// when a run is already active.
    pub fn try_acquire_run(&self, key: &str) -> bool {
        let mut inner = self.lock();
        inner.active.insert(key.to_string())
    }

    /// Toggle the active-run flag.
    pub fn set_active_run(&self, key: &str, active: bool) {
        let mut inner = self.lock();
        if active {
            inner.active.insert(key.to_string());
        } else {
            inner.active.remove(key);
        }
    }

    pub fn has_active_run(&self, key: &str) -> bool {
        self.lock().active.contains(key)
    }

    pub fn active_run_keys(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner.active.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Evict the in-memory entry. The persisted session and its events
    /// survive, so history remains queryable.
    pub fn remove(&self, key: &str) {
        let mut inner = self.lock();
        inner.sessions.remove(key);
        inner.active.remove(key);
        debug!(%key, "session evicted from registry");
    }

    /// All persisted sessions, with their transient active-run flags.
    pub fn list(&self) -> crate::error::Result<Vec<SessionInfo>> {
        let rows = self.store.list_sessions()?;
        let inner = self.lock();
        Ok(rows
            .into_iter()
            .map(|row| {
                let active_run = inner.active.contains(&row.session_key);
                SessionInfo { row, active_run }
            })
            .collect())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn desc(channel: &str, chat_type: &str, chat_id: &str) -> SessionDescriptor {
        SessionDescriptor {
            channel: channel.to_string(),
            chat_type: chat_type.to_string(),
            chat_id: chat_id.to_string(),
        }
    }

    // ── Key construction ──────────────────────────────────────────────────────

    #[test]
    fn make_key_joins_with_colons() {
        assert_eq!(make_key(&desc("telegram", "dm", "alice")), "telegram:dm:alice");
    }

    #[test]
    fn make_key_sanitizes_separators() {
        assert_eq!(
            make_key(&desc("desktop", "tab", "work/project:main")),
            "desktop:tab:work_project_main"
        );
    }

    #[test]
    fn make_key_trims_leading_and_trailing_underscores() {
        assert_eq!(make_key(&desc("c", "t", "/weird/")), "c:t:weird");
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[test]
    fn get_or_create_is_idempotent() {
        let r = registry();
        let a = r.get_or_create("k").unwrap();
        let b = r.get_or_create("k").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn remove_evicts_memory_but_keeps_row() {
        let r = registry();
        r.get_or_create("k").unwrap();
        r.remove("k");
        // Still listed from the store.
        let listed = r.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].row.session_key, "k");
    }

    #[test]
    fn counters_update_memory_and_store() {
        let r = registry();
        r.get_or_create("k").unwrap();
        r.increment_messages("k").unwrap();
        // Evict, then re-create from the store: the count must survive.
        r.remove("k");
        let row = r.get_or_create("k").unwrap();
        assert_eq!(row.message_count, 1);
    }

    #[test]
    fn external_id_round_trips() {
        let r = registry();
        r.get_or_create("k").unwrap();
        r.set_external_id("k", "sdk-99").unwrap();
        let listed = r.list().unwrap();
        assert_eq!(listed[0].row.external_id.as_deref(), Some("sdk-99"));
    }

    // ── Active-run flag ───────────────────────────────────────────────────────

    #[test]
    fn acquire_is_test_and_set() {
        let r = registry();
        assert!(r.try_acquire_run("k"));
        assert!(!r.try_acquire_run("k"), "second acquire must fail");
        r.set_active_run("k", false);
        assert!(r.try_acquire_run("k"), "release re-enables acquisition");
    }

    #[test]
    fn active_keys_are_tracked() {
        let r = registry();
        assert!(r.try_acquire_run("b"));
        assert!(r.try_acquire_run("a"));
        assert_eq!(r.active_run_keys(), vec!["a", "b"]);
        assert!(r.has_active_run("a"));
        r.set_active_run("a", false);
        assert!(!r.has_active_run("a"));
    }

    #[test]
    fn list_reports_active_flag() {
        let r = registry();
        r.get_or_create("k").unwrap();
        assert!(r.try_acquire_run("k"));
        let listed = r.list().unwrap();
        assert!(listed[0].active_run);
    }
}
