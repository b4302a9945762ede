// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Scripted and echo producers.
//!
//! [`MockProducer`] replays a fixed script and honors the full contract —
//! decision feedback, deny handling, prompt cancellation — so supervisor
//! and router tests can drive real runs without any model or subprocess.
//! [`EchoProducer`] is the stand-in driver the binary uses until a real
//! agent driver is plugged in: it streams the turn text back and completes.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{ErrorKind, ProducerEvent, ToolDecision};
use crate::producer::{AgentProducer, ProducerRun, UserTurn};

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a stream delta.
    Stream(String),
    /// Request a tool invocation and wait for the decision.  On allow, emit
    /// a `ToolUseResult` with `output`; on deny, perform nothing and move
    /// on (the gateway records the refusal).
    ToolUse {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
        output: String,
    },
    /// Emit the terminal result.
    Result {
        external_session_id: Option<String>,
        payload: serde_json::Value,
    },
    /// Emit a terminal error.
    Fail { kind: ErrorKind, message: String },
}

/// Replays a script, one run per `start` call.
#[derive(Debug, Clone, Default)]
pub struct MockProducer {
    script: Vec<ScriptStep>,
}

impl MockProducer {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self { script }
    }

    /// A minimal successful run: one delta, one result.
    pub fn trivial() -> Self {
        Self::new(vec![
            ScriptStep::Stream("ok".to_string()),
            ScriptStep::Result {
                external_session_id: None,
                payload: serde_json::json!({"text": "ok"}),
            },
        ])
    }
}

impl AgentProducer for MockProducer {
    fn start(&self, session_key: &str, _turn: UserTurn) -> ProducerRun {
        let (event_tx, events) = mpsc::channel(64);
        let (decision_tx, decision_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let script = self.script.clone();
        let key = session_key.to_string();
        let token = cancel.clone();
        tokio::spawn(async move {
            run_script(key, script, event_tx, decision_rx, token).await;
        });

        ProducerRun {
            events,
            decisions: decision_tx,
            cancel,
        }
    }
}

async fn run_script(
    session_key: String,
    script: Vec<ScriptStep>,
    event_tx: mpsc::Sender<ProducerEvent>,
    mut decision_rx: mpsc::Receiver<ToolDecision>,
    cancel: CancellationToken,
) {
    let mut emitted_terminal = false;

    for step in script {
        if cancel.is_cancelled() {
            break;
        }
        match step {
            ScriptStep::Stream(delta) => {
                if !send(&event_tx, &cancel, ProducerEvent::Stream { delta }).await {
                    break;
                }
            }
            ScriptStep::ToolUse {
                call_id,
                tool_name,
                args,
                output,
            } => {
                let request = ProducerEvent::ToolUseRequest {
                    call_id: call_id.clone(),
                    tool_name,
                    args,
                };
                if !send(&event_tx, &cancel, request).await {
                    break;
                }
                // Park until the gateway relays the decision.
                let decision = tokio::select! {
                    _ = cancel.cancelled() => None,
                    d = decision_rx.recv() => d,
                };
                match decision {
                    Some(d) if d.allow => {
                        let result = ProducerEvent::ToolUseResult {
                            call_id,
                            output,
                            is_error: false,
                        };
                        if !send(&event_tx, &cancel, result).await {
                            break;
                        }
                    }
                    Some(d) => {
                        debug!(session = %session_key, call = %d.call_id, "tool denied, skipping");
                    }
                    None => break,
                }
            }
            ScriptStep::Result {
                external_session_id,
                payload,
            } => {
                emitted_terminal = send(
                    &event_tx,
                    &cancel,
                    ProducerEvent::Result {
                        external_session_id,
                        payload,
                    },
                )
                .await;
                break;
            }
            ScriptStep::Fail { kind, message } => {
                emitted_terminal =
                    send(&event_tx, &cancel, ProducerEvent::Error { kind, message }).await;
                break;
            }
        }
    }

    if !emitted_terminal {
        let terminal = if cancel.is_cancelled() {
            ProducerEvent::Error {
                kind: ErrorKind::Aborted,
                message: "run cancelled".to_string(),
            }
        } else {
            // Script ran dry without a scripted terminal.
            ProducerEvent::Result {
                external_session_id: None,
                payload: serde_json::Value::Null,
            }
        };
        let _ = event_tx.send(terminal).await;
    }
}

/// Send one event, racing cancellation. Returns false when the run should
/// stop (cancelled or the gateway hung up).
async fn send(
    tx: &mpsc::Sender<ProducerEvent>,
    cancel: &CancellationToken,
    event: ProducerEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Streams the user turn back and completes. Placeholder driver for the
/// binary; real agent drivers implement [`AgentProducer`] out of tree.
#[derive(Debug, Clone, Default)]
pub struct EchoProducer;

impl AgentProducer for EchoProducer {
    fn start(&self, _session_key: &str, turn: UserTurn) -> ProducerRun {
        let (event_tx, events) = mpsc::channel(8);
        let (decision_tx, _decision_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            let stream = ProducerEvent::Stream {
                delta: turn.text.clone(),
            };
            if send(&event_tx, &token, stream).await {
                let _ = event_tx
                    .send(ProducerEvent::Result {
                        external_session_id: None,
                        payload: serde_json::json!({ "text": turn.text }),
                    })
                    .await;
            } else if token.is_cancelled() {
                let _ = event_tx
                    .send(ProducerEvent::Error {
                        kind: ErrorKind::Aborted,
                        message: "run cancelled".to_string(),
                    })
                    .await;
            }
        });

        ProducerRun {
            events,
            decisions: decision_tx,
            cancel,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(run: &mut ProducerRun) -> Vec<ProducerEvent> {
        let mut out = Vec::new();
        while let Some(ev) = run.events.recv().await {
            let terminal = ev.is_terminal();
            out.push(ev);
            if terminal {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn trivial_script_ends_in_one_result() {
        let mut run = MockProducer::trivial().start("k", UserTurn::new("hi"));
        let events = drain(&mut run).await;
        assert_eq!(events.len(), 2);
        assert!(events.last().is_some_and(|e| e.is_terminal()));
    }

    #[tokio::test]
    async fn empty_script_still_emits_a_terminal() {
        let mut run = MockProducer::new(vec![]).start("k", UserTurn::new("hi"));
        let events = drain(&mut run).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProducerEvent::Result { .. }));
    }

    #[tokio::test]
    async fn allowed_tool_emits_result() {
        let script = vec![ScriptStep::ToolUse {
            call_id: "c1".to_string(),
            tool_name: "read_file".to_string(),
            args: serde_json::json!({"path": "x"}),
            output: "contents".to_string(),
        }];
        let mut run = MockProducer::new(script).start("k", UserTurn::new("go"));

        let first = run.events.recv().await.unwrap();
        assert!(matches!(first, ProducerEvent::ToolUseRequest { .. }));

        run.decisions
            .send(ToolDecision {
                call_id: "c1".to_string(),
                allow: true,
                reason: None,
            })
            .await
            .unwrap();

        let second = run.events.recv().await.unwrap();
        match second {
            ProducerEvent::ToolUseResult { output, .. } => assert_eq!(output, "contents"),
            other => panic!("expected ToolUseResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn denied_tool_performs_nothing() {
        let script = vec![ScriptStep::ToolUse {
            call_id: "c1".to_string(),
            tool_name: "bash".to_string(),
            args: serde_json::json!({"command": "rm -rf /tmp/x"}),
            output: "side effect".to_string(),
        }];
        let mut run = MockProducer::new(script).start("k", UserTurn::new("go"));

        let _request = run.events.recv().await.unwrap();
        run.decisions
            .send(ToolDecision {
                call_id: "c1".to_string(),
                allow: false,
                reason: Some("operator denied".to_string()),
            })
            .await
            .unwrap();

        // Next event must be the synthesized terminal, not a tool result.
        let next = run.events.recv().await.unwrap();
        assert!(
            matches!(next, ProducerEvent::Result { .. }),
            "deny must skip the side effect, got {next:?}"
        );
    }

    #[tokio::test]
    async fn cancel_yields_aborted_error() {
        let script = vec![ScriptStep::ToolUse {
            call_id: "c1".to_string(),
            tool_name: "bash".to_string(),
            args: serde_json::json!({}),
            output: String::new(),
        }];
        let mut run = MockProducer::new(script).start("k", UserTurn::new("go"));

        let _request = run.events.recv().await.unwrap();
        run.cancel.cancel();

        let next = run.events.recv().await.unwrap();
        assert!(matches!(
            next,
            ProducerEvent::Error {
                kind: ErrorKind::Aborted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn echo_producer_streams_the_turn_back() {
        let mut run = EchoProducer.start("k", UserTurn::new("ping"));
        let events = drain(&mut run).await;
        assert!(matches!(
            &events[0],
            ProducerEvent::Stream { delta } if delta == "ping"
        ));
        assert!(events.last().is_some_and(|e| e.is_terminal()));
    }
}
