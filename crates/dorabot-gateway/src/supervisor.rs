// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent supervisor — per-session lifecycle of at most one run.
//!
//! `start` acquires the session's active-run flag (test-and-set on the
//! registry), spawns the producer, and pumps every producer event into the
//! event log in production order.  The pump is one task per run, so events
//! of a single session appear in the log in the order the producer emitted
//! them; runs on different sessions interleave by `seq`.
//!
//! Producer events are strictly required in the log: if an append fails,
//! the run is cancelled and a terminal `agent.error` is appended best
//! effort.  There is exactly one terminal event per run — the producer's
//! own, or one synthesized here when the producer dies without it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use dorabot_agent::{AgentProducer, ErrorKind, ProducerEvent, ProducerRun, ToolDecision, UserTurn};
use dorabot_store::StreamEventKind;

use crate::approvals::{Approvals, Decision, DenyReason};
use crate::events::EventLog;
use crate::registry::SessionRegistry;

#[derive(Clone)]
struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
}

pub struct Supervisor {
    producer: Arc<dyn AgentProducer>,
    events: EventLog,
    registry: Arc<SessionRegistry>,
    approvals: Arc<Approvals>,
    runs: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl Supervisor {
    pub fn new(
        producer: Arc<dyn AgentProducer>,
        events: EventLog,
        registry: Arc<SessionRegistry>,
        approvals: Arc<Approvals>,
    ) -> Self {
        Self {
            producer,
            events,
            registry,
            approvals,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run for `session_key`. Fails fast with `Busy` when the
    /// session already has one — the prior run is never cancelled on
    /// contention.
    pub async fn start(&self, session_key: &str, turn: UserTurn) -> crate::error::Result<Uuid> {
        self.registry.get_or_create(session_key)?;

        if !self.registry.try_acquire_run(session_key) {
            return Err(crate::GatewayError::Busy(session_key.to_string()));
        }

        // The user turn counts against the session immediately.
        if let Err(e) = self.record_user_turn(session_key, &turn) {
            self.registry.set_active_run(session_key, false);
            return Err(e);
        }

        let run_id = Uuid::new_v4();
        let run = self.producer.start(session_key, turn);

        self.runs().insert(
            session_key.to_string(),
            RunHandle {
                run_id,
                cancel: run.cancel.clone(),
            },
        );
        info!(session = %session_key, %run_id, "run started");

        let pump = Pump {
            session_key: session_key.to_string(),
            run_id,
            events: self.events.clone(),
            registry: self.registry.clone(),
            approvals: self.approvals.clone(),
            runs: self.runs.clone(),
        };
        tokio::spawn(pump.run(run));

        Ok(run_id)
    }

    fn record_user_turn(&self, session_key: &str, turn: &UserTurn) -> crate::error::Result<()> {
        self.registry.increment_messages(session_key)?;
        self.events
            .store()
            .record_message(session_key, "user", &turn.text)?;
        Ok(())
    }

    /// Cancel the active run, if any. Returns whether a run was cancelled.
    /// In-flight approvals are rejected immediately; events up to and
    /// including the terminal `agent.error(aborted)` are still appended.
    pub async fn abort(&self, session_key: &str) -> crate::error::Result<bool> {
        let handle = self.runs().get(session_key).cloned();
        let Some(handle) = handle else {
            return Ok(false);
        };
        info!(session = %session_key, run_id = %handle.run_id, "run aborted");
        handle.cancel.cancel();
        self.approvals
            .cancel_all_for(session_key, DenyReason::AgentCancel)
            .await?;
        Ok(true)
    }

    /// Cancel every active run (shutdown, global escape shortcut).
    pub async fn abort_all(&self) -> crate::error::Result<()> {
        let keys: Vec<String> = self.runs().keys().cloned().collect();
        for key in keys {
            self.abort(&key).await?;
        }
        Ok(())
    }

    /// The active run id for a session, if one exists.
    pub fn active_run_id(&self, session_key: &str) -> Option<Uuid> {
        self.runs().get(session_key).map(|h| h.run_id)
    }
}

/// The per-run event pump. Owns everything the spawned task needs, so the
/// supervisor itself never moves into the task.
struct Pump {
    session_key: String,
    run_id: Uuid,
    events: EventLog,
    registry: Arc<SessionRegistry>,
    approvals: Arc<Approvals>,
    runs: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl Pump {
    async fn run(self, producer_run: ProducerRun) {
        let ProducerRun {
            mut events,
            decisions,
            cancel,
        } = producer_run;

        let mut saw_terminal = false;

        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            if let Err(e) = self.handle_event(event, &decisions).await {
                error!(
                    session = %self.session_key,
                    run_id = %self.run_id,
                    "append failed, aborting run: {e}"
                );
                cancel.cancel();
                let data = serde_json::json!({
                    "kind": ErrorKind::Aborted,
                    "message": format!("event append failed: {e}"),
                });
                if self
                    .events
                    .append(&self.session_key, StreamEventKind::Error, &data.to_string())
                    .await
                    .is_err()
                {
                    warn!(session = %self.session_key, "terminal append also failed");
                }
                saw_terminal = true;
                break;
            }
            if terminal {
                saw_terminal = true;
                break;
            }
        }

        if !saw_terminal {
            // The producer hung up without its terminal event.
            let data = serde_json::json!({
                "kind": ErrorKind::ProducerCrash,
                "message": "producer ended without a terminal event",
            });
            if let Err(e) = self
                .events
                .append(&self.session_key, StreamEventKind::Error, &data.to_string())
                .await
            {
                warn!(session = %self.session_key, "could not append synthesized terminal: {e}");
            }
        }

        // Release stragglers, then the session itself.
        if let Err(e) = self
            .approvals
            .cancel_all_for(&self.session_key, DenyReason::AgentCancel)
            .await
        {
            warn!(session = %self.session_key, "pending approval cleanup failed: {e}");
        }
        self.registry.set_active_run(&self.session_key, false);
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_key);
        info!(session = %self.session_key, run_id = %self.run_id, "run finished");
    }

    async fn handle_event(
        &self,
        event: ProducerEvent,
        decisions: &mpsc::Sender<ToolDecision>,
    ) -> crate::error::Result<()> {
        let key = self.session_key.as_str();
        match event {
            ProducerEvent::Stream { delta } => {
                let data = serde_json::json!({ "delta": delta });
                self.events
                    .append(key, StreamEventKind::Stream, &data.to_string())
                    .await?;
            }
            ProducerEvent::ToolUseRequest {
                call_id,
                tool_name,
                args,
            } => {
                let data = serde_json::json!({
                    "callId": call_id,
                    "toolName": tool_name,
                    "args": args,
                });
                self.events
                    .append(key, StreamEventKind::ToolUseRequest, &data.to_string())
                    .await?;

                let decision = self
                    .approvals
                    .request(key, &call_id, &tool_name, &args)
                    .await?;
                let feedback = match decision {
                    Decision::Allow => ToolDecision {
                        call_id,
                        allow: true,
                        reason: None,
                    },
                    Decision::Deny { reason, rationale } => ToolDecision {
                        call_id,
                        allow: false,
                        reason: Some(rationale.unwrap_or_else(|| reason.as_str().to_string())),
                    },
                };
                // A closed decision channel means the producer is gone; the
                // event loop will observe that on the next recv.
                let _ = decisions.send(feedback).await;
            }
            ProducerEvent::ToolUseResult {
                call_id,
                output,
                is_error,
            } => {
                let data = serde_json::json!({
                    "callId": call_id,
                    "output": output,
                    "isError": is_error,
                    "denied": false,
                });
                self.events
                    .append(key, StreamEventKind::ToolUseResult, &data.to_string())
                    .await?;
            }
            ProducerEvent::Result {
                external_session_id,
                payload,
            } => {
                self.events
                    .append(key, StreamEventKind::Result, &payload.to_string())
                    .await?;
                if let Some(external) = external_session_id {
                    self.registry.set_external_id(key, &external)?;
                }
                self.registry.increment_messages(key)?;
                self.events
                    .store()
                    .record_message(key, "assistant", &payload.to_string())?;
            }
            ProducerEvent::Error { kind, message } => {
                let data = serde_json::json!({ "kind": kind, "message": message });
                self.events
                    .append(key, StreamEventKind::Error, &data.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dorabot_agent::{MockProducer, ScriptStep};
    use dorabot_config::ApprovalsConfig;
    use dorabot_store::{Cursor, Store};

    fn supervisor(producer: MockProducer) -> (Supervisor, EventLog, Arc<SessionRegistry>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let events = EventLog::new(store.clone());
        let registry = Arc::new(SessionRegistry::new(store));
        let approvals = Arc::new(Approvals::new(
            events.clone(),
            &ApprovalsConfig::default(),
        ));
        let sup = Supervisor::new(Arc::new(producer), events.clone(), registry.clone(), approvals);
        (sup, events, registry)
    }

    async fn wait_for_terminal(events: &EventLog, key: &str) -> Vec<StreamEventKind> {
        for _ in 0..200 {
            let kinds: Vec<StreamEventKind> = events
                .store()
                .query_by_cursors(&[Cursor::new(key, 0)], 100)
                .unwrap()
                .into_iter()
                .map(|e| e.kind)
                .collect();
            if kinds.iter().any(|k| k.is_terminal()) {
                return kinds;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no terminal event appeared for {key}");
    }

    #[tokio::test]
    async fn run_appends_events_in_production_order() {
        let script = vec![
            ScriptStep::Stream("a".to_string()),
            ScriptStep::Stream("b".to_string()),
            ScriptStep::Result {
                external_session_id: None,
                payload: serde_json::json!({"text": "done"}),
            },
        ];
        let (sup, events, _) = supervisor(MockProducer::new(script));
        sup.start("k", UserTurn::new("go")).await.unwrap();

        let kinds = wait_for_terminal(&events, "k").await;
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Stream,
                StreamEventKind::Stream,
                StreamEventKind::Result
            ]
        );
    }

    #[tokio::test]
    async fn exactly_one_terminal_and_flag_cleared() {
        let (sup, events, registry) = supervisor(MockProducer::trivial());
        sup.start("k", UserTurn::new("go")).await.unwrap();

        let kinds = wait_for_terminal(&events, "k").await;
        assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);

        // The flag clears shortly after the terminal append.
        for _ in 0..100 {
            if !registry.has_active_run("k") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!registry.has_active_run("k"));
    }

    #[tokio::test]
    async fn second_start_on_busy_session_fails_fast() {
        // A producer that parks on an approval keeps the run active.
        let script = vec![ScriptStep::ToolUse {
            call_id: "c1".to_string(),
            tool_name: "write".to_string(),
            args: serde_json::json!({}),
            output: String::new(),
        }];
        let (sup, _, _) = supervisor(MockProducer::new(script));

        sup.start("k", UserTurn::new("one")).await.unwrap();
        let second = sup.start("k", UserTurn::new("two")).await;
        assert!(matches!(second, Err(crate::GatewayError::Busy(_))));
        sup.abort("k").await.unwrap();
    }

    #[tokio::test]
    async fn start_succeeds_again_after_terminal() {
        let (sup, events, _) = supervisor(MockProducer::trivial());
        sup.start("k", UserTurn::new("one")).await.unwrap();
        wait_for_terminal(&events, "k").await;

        // Wait for the pump to release the flag.
        for _ in 0..100 {
            if sup.active_run_id("k").is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(sup.start("k", UserTurn::new("two")).await.is_ok());
    }

    #[tokio::test]
    async fn abort_yields_aborted_terminal() {
        let script = vec![ScriptStep::ToolUse {
            call_id: "c1".to_string(),
            tool_name: "write".to_string(),
            args: serde_json::json!({}),
            output: String::new(),
        }];
        let (sup, events, _) = supervisor(MockProducer::new(script));
        sup.start("k", UserTurn::new("go")).await.unwrap();

        // Let the tool-use request land, then abort.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(sup.abort("k").await.unwrap());

        let kinds = wait_for_terminal(&events, "k").await;
        assert!(kinds.contains(&StreamEventKind::Error));
    }

    #[tokio::test]
    async fn abort_without_run_reports_false() {
        let (sup, _, _) = supervisor(MockProducer::trivial());
        assert!(!sup.abort("k").await.unwrap());
    }

    #[tokio::test]
    async fn runs_on_distinct_sessions_are_independent() {
        let (sup, events, _) = supervisor(MockProducer::trivial());
        sup.start("a", UserTurn::new("one")).await.unwrap();
        sup.start("b", UserTurn::new("two")).await.unwrap();
        wait_for_terminal(&events, "a").await;
        wait_for_terminal(&events, "b").await;
    }

    #[tokio::test]
    async fn terminal_result_updates_registry() {
        let script = vec![ScriptStep::Result {
            external_session_id: Some("sdk-42".to_string()),
            payload: serde_json::json!({"text": "done"}),
        }];
        let (sup, events, registry) = supervisor(MockProducer::new(script));
        sup.start("k", UserTurn::new("go")).await.unwrap();
        wait_for_terminal(&events, "k").await;

        // Registry updates land before the pump exits; poll briefly.
        for _ in 0..100 {
            let listed = registry.list().unwrap();
            let row = &listed[0].row;
            if row.external_id.is_some() && row.message_count == 2 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let listed = registry.list().unwrap();
        panic!("registry not updated: {:?}", listed[0].row);
    }
}
