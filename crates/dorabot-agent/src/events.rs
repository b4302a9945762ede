// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Events emitted by an agent producer during one run.
///
/// A run is a finite sequence ending in exactly one terminal event
/// ([`ProducerEvent::Result`] or [`ProducerEvent::Error`]).  The gateway
/// pumps every event into the stream log; payload contents stay opaque to
/// it except for approval classification of tool-use requests.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    /// An incremental output chunk.
    Stream { delta: String },

    /// The producer wants to invoke a tool.  It must not perform the side
    /// effect until the matching [`ToolDecision`] arrives, and must honor a
    /// deny by skipping the invocation entirely.
    ToolUseRequest {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },

    /// A tool invocation finished (only sent for allowed invocations; the
    /// gateway records refusals itself).
    ToolUseResult {
        call_id: String,
        output: String,
        is_error: bool,
    },

    /// Terminal: the run completed.  `external_session_id` is the
    /// provider-assigned conversation id, recorded in the session registry.
    Result {
        external_session_id: Option<String>,
        payload: serde_json::Value,
    },

    /// Terminal: the run failed or was aborted.
    Error { kind: ErrorKind, message: String },
}

impl ProducerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }
}

/// Structured failure kinds carried by terminal `agent.error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The run was cancelled cooperatively.
    Aborted,
    /// The producer ended without a terminal event.
    ProducerCrash,
    /// The producer exceeded its own deadline.
    Timeout,
    /// The run could not proceed past a denied tool.
    ToolDenied,
}

/// Decision fed back to the producer for one pending tool-use request.
#[derive(Debug, Clone)]
pub struct ToolDecision {
    pub call_id: String,
    pub allow: bool,
    pub reason: Option<String>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_result_and_error_are_terminal() {
        assert!(ProducerEvent::Result {
            external_session_id: None,
            payload: serde_json::Value::Null
        }
        .is_terminal());
        assert!(ProducerEvent::Error {
            kind: ErrorKind::Aborted,
            message: String::new()
        }
        .is_terminal());
        assert!(!ProducerEvent::Stream {
            delta: "x".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::ProducerCrash).unwrap();
        assert_eq!(s, "\"producer_crash\"");
    }
}
