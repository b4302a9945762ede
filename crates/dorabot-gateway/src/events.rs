// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Event log with live fan-out.
//!
//! [`EventLog`] wraps the durable store with a single in-process broadcast
//! channel.  Persisting a row and publishing it happen under one async
//! mutex, so the broadcast observes events in exactly `seq` order — the
//! property every subscriber's replay/live stitching relies on.
//!
//! Subscribers that lag the broadcast do not lose anything: they re-read
//! the store from their cursors (see `rpc::subscriptions`).

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use dorabot_store::{Store, StreamEventKind};

/// Broadcast capacity. Sized for bursts; a receiver that falls this far
/// behind catches up from the store instead.
const BROADCAST_CAPACITY: usize = 4096;

/// One appended event as published to live subscribers.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub seq: i64,
    pub session_key: String,
    pub kind: StreamEventKind,
    pub data: String,
}

/// Cheap-to-clone handle over the append path and the live broadcast.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<Store>,
    tx: broadcast::Sender<EventRecord>,
    append_lock: Arc<Mutex<()>>,
}

impl EventLog {
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            store,
            tx,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append one event and publish it to live subscribers.
    ///
    /// Insert and publish form one critical section; two concurrent appends
    /// publish in the same order the store assigned their `seq`s.
    pub async fn append(
        &self,
        session_key: &str,
        kind: StreamEventKind,
        data: &str,
    ) -> crate::error::Result<i64> {
        let _guard = self.append_lock.lock().await;
        let seq = self.store.append_event(session_key, kind, data)?;
        // No subscribers is fine (nobody connected yet).
        let _ = self.tx.send(EventRecord {
            seq,
            session_key: session_key.to_string(),
            kind,
            data: data.to_string(),
        });
        Ok(seq)
    }

    /// Subscribe to the live feed.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// The underlying store, for cursor reads.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
