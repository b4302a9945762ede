// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-connection subscription state and event delivery.
//!
//! Each connection keeps one cursor per subscribed session key: the `seq`
//! of the last event delivered to that client for that key.  Both delivery
//! paths — paged replay from the store and the live broadcast — advance the
//! same cursor under the same lock, and both deliver strictly after it.
//! That single rule makes replay + live a contiguous, duplicate-free
//! sequence, including across reconnects, with no deduplication anywhere.
//!
//! Delivery is decoupled from the socket by a bounded outbound queue.  A
//! connection whose queue overflows is closed (`ErrSlowConsumer`); the
//! client reconnects and resumes from its last cursor via replay.  A lagged
//! broadcast receiver is handled the same way a reconnect is: re-read the
//! store from the cursors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use dorabot_store::Cursor;

use crate::events::EventRecord;
use crate::gateway::Gateway;
use crate::rpc::protocol::{event_frame, EventParams};
use crate::GatewayError;

/// Frames queued for the socket writer.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Pong(Vec<u8>),
}

/// Cursors for one connection: session key → last delivered `seq`.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    cursors: HashMap<String, i64>,
}

impl SubscriptionState {
    pub fn session_keys(&self) -> Vec<String> {
        self.cursors.keys().cloned().collect()
    }
}

/// One connected client.
pub struct Connection {
    pub id: Uuid,
    authed: AtomicBool,
    outbound: mpsc::Sender<OutboundFrame>,
    pub subs: tokio::sync::Mutex<SubscriptionState>,
    active_session: Mutex<Option<String>>,
    acked_seq: AtomicI64,
    /// Cancelled when the connection must tear down (slow consumer, auth
    /// failure, socket close).
    pub closed: CancellationToken,
}

impl Connection {
    /// Create the connection and its outbound queue (bounded at
    /// `queue_bound` frames).
    pub fn new(queue_bound: usize) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(queue_bound);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            authed: AtomicBool::new(false),
            outbound: tx,
            subs: tokio::sync::Mutex::new(SubscriptionState::default()),
            active_session: Mutex::new(None),
            acked_seq: AtomicI64::new(0),
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn is_authed(&self) -> bool {
        self.authed.load(Ordering::Acquire)
    }

    pub fn set_authed(&self) {
        self.authed.store(true, Ordering::Release);
    }

    pub fn active_session(&self) -> Option<String> {
        self.active_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_active_session(&self, key: Option<String>) {
        *self
            .active_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = key;
    }

    /// The connection's acknowledged high-water mark over `seq`.
    pub fn acked_seq(&self) -> i64 {
        self.acked_seq.load(Ordering::Acquire)
    }

    /// Advance the high-water mark; acks never move backwards.
    pub fn ack(&self, seq: i64) {
        self.acked_seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Queue one frame. Overflow closes the connection: a client that
    /// cannot keep up resumes from its cursor after reconnecting.
    pub fn push(&self, frame: OutboundFrame) -> crate::error::Result<()> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.id, "outbound queue overflow, closing connection");
                self.closed.cancel();
                Err(GatewayError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.cancel();
                Err(GatewayError::Internal("connection writer gone".to_string()))
            }
        }
    }

    fn push_event(&self, record: &EventRecord) -> crate::error::Result<()> {
        self.push(OutboundFrame::Text(event_frame(&EventParams {
            session_key: record.session_key.clone(),
            seq: record.seq,
            event_type: record.kind.as_str().to_string(),
            data: record.data.clone(),
        })))
    }
}

/// Install subscriptions (resetting any existing cursor for the same key)
/// and replay everything strictly after each cursor, in pages.
///
/// The state lock is held across the whole replay: live events arriving
/// meanwhile buffer in the broadcast channel and are filtered against the
/// advanced cursors afterwards.
pub async fn subscribe_and_replay(
    gateway: &Gateway,
    conn: &Connection,
    subscriptions: Vec<(String, i64)>,
) -> crate::error::Result<usize> {
    let mut state = conn.subs.lock().await;
    let keys: Vec<String> = subscriptions.iter().map(|(k, _)| k.clone()).collect();
    for (key, after_seq) in subscriptions {
        state.cursors.insert(key, after_seq);
    }
    replay_locked(gateway, conn, &mut state, &keys).await
}

/// Remove subscriptions for the given keys.
pub async fn unsubscribe(conn: &Connection, keys: &[String]) {
    let mut state = conn.subs.lock().await;
    for key in keys {
        state.cursors.remove(key);
    }
}

async fn replay_locked(
    gateway: &Gateway,
    conn: &Connection,
    state: &mut SubscriptionState,
    keys: &[String],
) -> crate::error::Result<usize> {
    let page_size = gateway.config().limits.replay_page;
    let mut delivered = 0;

    loop {
        let cursors: Vec<Cursor> = keys
            .iter()
            .filter_map(|k| state.cursors.get(k).map(|after| Cursor::new(k.clone(), *after)))
            .collect();
        if cursors.is_empty() {
            return Ok(delivered);
        }

        let page = gateway.store().query_by_cursors(&cursors, page_size)?;
        let n = page.len();
        for event in page {
            state.cursors.insert(event.session_key.clone(), event.seq);
            conn.push_event(&EventRecord {
                seq: event.seq,
                session_key: event.session_key,
                kind: event.kind,
                data: event.data,
            })?;
            delivered += 1;
        }
        if n < page_size {
            return Ok(delivered);
        }
    }
}

/// Forward live events to one connection until it closes.
///
/// Spawned once per connection.  Filters the global broadcast by the
/// connection's subscription set and the strictly-after rule.
pub async fn pump_live(
    gateway: Arc<Gateway>,
    conn: Arc<Connection>,
    mut rx: broadcast::Receiver<EventRecord>,
) {
    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => return,
            received = rx.recv() => match received {
                Ok(record) => {
                    let mut state = conn.subs.lock().await;
                    let Some(last) = state.cursors.get_mut(&record.session_key) else {
                        continue;
                    };
                    if record.seq <= *last {
                        continue;
                    }
                    *last = record.seq;
                    if conn.push_event(&record).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(conn = %conn.id, lagged = n, "live feed lagged, catching up from store");
                    let mut state = conn.subs.lock().await;
                    let keys = state.session_keys();
                    if replay_locked(&gateway, &conn, &mut state, &keys)
                        .await
                        .is_err()
                    {
                        conn.closed.cancel();
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_never_moves_backwards() {
        let (conn, _rx) = Connection::new(16);
        conn.ack(10);
        conn.ack(5);
        assert_eq!(conn.acked_seq(), 10);
        conn.ack(12);
        assert_eq!(conn.acked_seq(), 12);
    }

    #[test]
    fn push_overflow_closes_connection() {
        let (conn, _rx) = Connection::new(1);
        assert!(conn.push(OutboundFrame::Text("a".to_string())).is_ok());
        let err = conn.push(OutboundFrame::Text("b".to_string()));
        assert!(matches!(err, Err(GatewayError::SlowConsumer)));
        assert!(conn.closed.is_cancelled());
    }

    #[test]
    fn active_session_round_trips() {
        let (conn, _rx) = Connection::new(4);
        assert!(conn.active_session().is_none());
        conn.set_active_session(Some("k".to_string()));
        assert_eq!(conn.active_session().as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_cursors() {
        let (conn, _rx) = Connection::new(4);
        conn.subs
            .lock()
            .await
            .cursors
            .insert("k".to_string(), 3);
        unsubscribe(&conn, &["k".to_string()]).await;
        assert!(conn.subs.lock().await.cursors.is_empty());
    }
}
