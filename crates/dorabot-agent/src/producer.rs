// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The producer contract.
//!
//! A producer is the driver for an external agent process.  The gateway
//! treats it as a lazy, finite, non-restartable event sequence with a
//! single terminal element.  The handoff is message passing end to end:
//! events flow out over an mpsc channel, tool decisions flow back over
//! another, and cancellation is a token — no shared mutable callbacks.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{ProducerEvent, ToolDecision};

/// One user turn handed to a producer.
#[derive(Debug, Clone)]
pub struct UserTurn {
    pub text: String,
}

impl UserTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// The live end of a spawned run.
///
/// Dropping the event receiver does not cancel the producer; use `cancel`.
/// A cancelled producer emits `Error { kind: Aborted }` promptly and stops.
pub struct ProducerRun {
    pub events: mpsc::Receiver<ProducerEvent>,
    pub decisions: mpsc::Sender<ToolDecision>,
    pub cancel: CancellationToken,
}

/// An agent driver.  Implementations spawn the underlying process (or task)
/// and bridge its output into the typed event stream.
pub trait AgentProducer: Send + Sync {
    fn start(&self, session_key: &str, turn: UserTurn) -> ProducerRun;
}
