// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The process-wide gateway state.
//!
//! One explicit value owns everything: store, event log, registry,
//! approval coordinator, supervisor, token, and the connection table.
//! It is constructed once at startup, handed to every handler as an
//! `Arc<Gateway>`, and torn down on shutdown — no module-level state.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use dorabot_agent::AgentProducer;
use dorabot_config::GatewayConfig;
use dorabot_store::Store;

use crate::approvals::{Approvals, DenyReason};
use crate::crypto::GatewayToken;
use crate::events::EventLog;
use crate::registry::SessionRegistry;
use crate::rpc::subscriptions::{Connection, OutboundFrame};
use crate::supervisor::Supervisor;

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<Store>,
    events: EventLog,
    registry: Arc<SessionRegistry>,
    approvals: Arc<Approvals>,
    supervisor: Supervisor,
    token: GatewayToken,
    connections: DashMap<Uuid, Arc<Connection>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<Store>,
        producer: Arc<dyn AgentProducer>,
        token: GatewayToken,
    ) -> Arc<Self> {
        let events = EventLog::new(store.clone());
        let registry = Arc::new(SessionRegistry::new(store.clone()));
        let approvals = Arc::new(Approvals::new(events.clone(), &config.approvals));
        let supervisor = Supervisor::new(
            producer,
            events.clone(),
            registry.clone(),
            approvals.clone(),
        );

        Arc::new(Self {
            config,
            store,
            events,
            registry,
            approvals,
            supervisor,
            token,
            connections: DashMap::new(),
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn approvals(&self) -> &Approvals {
        &self.approvals
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn token(&self) -> &GatewayToken {
        &self.token
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Register a new client connection and its outbound queue.
    pub fn register_connection(&self) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = Connection::new(self.config.limits.outbound_queue);
        info!(conn = %conn.id, "client connected");
        self.connections.insert(conn.id, conn.clone());
        (conn, rx)
    }

    /// Tear one connection down: drop it from the table and reject pending
    /// approvals owned by its focused session.
    pub async fn release_connection(&self, conn: &Arc<Connection>) {
        conn.closed.cancel();
        self.connections.remove(&conn.id);
        if let Some(key) = conn.active_session() {
            if let Err(e) = self
                .approvals
                .cancel_all_for(&key, DenyReason::SessionClose)
                .await
            {
                debug!(conn = %conn.id, session = %key, "approval cleanup on close failed: {e}");
            }
        }
        info!(conn = %conn.id, "client disconnected");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The minimum acknowledged `seq` across currently connected clients,
    /// or `None` when nobody is connected.
    pub fn min_acked_seq(&self) -> Option<i64> {
        self.connections
            .iter()
            .map(|entry| entry.value().acked_seq())
            .min()
    }

    // ── Retention ─────────────────────────────────────────────────────────────

    /// One sweep pass: remove events past the retention horizon, floored at
    /// the minimum acknowledged cursor so attached slow readers keep their
    /// tails.  With no clients connected the age horizon alone applies.
    pub fn sweep_once(&self) -> crate::error::Result<usize> {
        let max_age = self.config.retention.max_age_secs;
        let removed = match self.min_acked_seq() {
            Some(floor) => self.store.sweep_events_with_floor(max_age, floor)?,
            None => self.store.sweep_events(max_age)?,
        };
        Ok(removed)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
