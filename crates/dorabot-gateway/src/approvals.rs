// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Approval coordinator.
//!
//! Holds pending approval requests and correlates operator decisions back
//! to the waiting producer.  The handoff is message passing: the requester
//! parks on a oneshot, every resolution path (operator decision, timeout,
//! run cancellation, session close) goes through [`Approvals::resolve`],
//! and the first resolution wins — duplicates are ignored.
//!
//! Every deny, whatever its source, appends a `agent.tool_use_result` event
//! with `denied: true` so subscribers observe the refusal exactly like any
//! other event.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dorabot_config::ApprovalsConfig;
use dorabot_policy::{Tier, ToolPolicy};
use dorabot_store::StreamEventKind;

use crate::events::EventLog;

/// Outcome of an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        reason: DenyReason,
        rationale: Option<String>,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Why a pending approval was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    /// An operator said no.
    User,
    /// Nobody decided before the tier's expiry.
    Timeout,
    /// The run was cancelled while the request was pending.
    AgentCancel,
    /// The connection owning the session went away.
    SessionClose,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
            Self::AgentCancel => "agent-cancel",
            Self::SessionClose => "session-close",
        }
    }
}

struct Pending {
    session_key: String,
    call_id: String,
    tool_name: String,
    tx: oneshot::Sender<Decision>,
}

/// Coordinator state: the policy, the pending map, per-tier expiries.
pub struct Approvals {
    policy: ToolPolicy,
    events: EventLog,
    pending: Mutex<HashMap<Uuid, Pending>>,
    require_timeout: Duration,
    notify_timeout: Duration,
}

impl Approvals {
    pub fn new(events: EventLog, config: &ApprovalsConfig) -> Self {
        Self {
            policy: ToolPolicy::new(),
            events,
            pending: Mutex::new(HashMap::new()),
            require_timeout: Duration::from_secs(config.require_timeout_secs),
            notify_timeout: Duration::from_secs(config.notify_timeout_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expiry for a parked request of the given tier.
    fn expiry(&self, tier: Tier) -> Duration {
        match tier {
            Tier::RequireApproval => self.require_timeout,
            Tier::Notify => self.notify_timeout,
            Tier::AutoAllow => Duration::ZERO,
        }
    }

    /// Classify a tool invocation and, when the tier demands it, park until
    /// an operator decides (or the expiry passes).
    ///
    /// `auto-allow` returns immediately.  `notify` appends the approval
    /// event for subscribers but never blocks the producer; flipping that
    /// interpretation would mean routing it through the parking branch
    /// below with [`Self::notify_timeout`].
    pub async fn request(
        &self,
        session_key: &str,
        call_id: &str,
        tool_name: &str,
        args: &serde_json::Value,
    ) -> crate::error::Result<Decision> {
        let tier = self.policy.classify(tool_name, args);
        match tier {
            Tier::AutoAllow => Ok(Decision::Allow),
            Tier::Notify => {
                self.append_request_event(Uuid::new_v4(), session_key, call_id, tool_name, args, tier)
                    .await?;
                Ok(Decision::Allow)
            }
            Tier::RequireApproval => {
                let approval_id = Uuid::new_v4();
                let (tx, rx) = oneshot::channel();
                self.lock().insert(
                    approval_id,
                    Pending {
                        session_key: session_key.to_string(),
                        call_id: call_id.to_string(),
                        tool_name: tool_name.to_string(),
                        tx,
                    },
                );

                if let Err(e) = self
                    .append_request_event(approval_id, session_key, call_id, tool_name, args, tier)
                    .await
                {
                    self.lock().remove(&approval_id);
                    return Err(e);
                }
                info!(%approval_id, session = %session_key, tool = %tool_name, "approval pending");

                match tokio::time::timeout(self.expiry(tier), rx).await {
                    Ok(Ok(decision)) => Ok(decision),
                    // Resolver dropped without a decision — the pending was
                    // discarded during teardown.
                    Ok(Err(_)) => Ok(Decision::Deny {
                        reason: DenyReason::AgentCancel,
                        rationale: None,
                    }),
                    Err(_) => {
                        warn!(%approval_id, tool = %tool_name, "approval expired");
                        self.resolve(
                            approval_id,
                            Decision::Deny {
                                reason: DenyReason::Timeout,
                                rationale: None,
                            },
                        )
                        .await?;
                        Ok(Decision::Deny {
                            reason: DenyReason::Timeout,
                            rationale: None,
                        })
                    }
                }
            }
        }
    }

    /// Apply an operator decision. Returns `false` when the id is unknown —
    /// already resolved, expired, or never issued; duplicates are ignored
    /// by design.
    pub async fn decide(
        &self,
        approval_id: Uuid,
        allow: bool,
        rationale: Option<String>,
    ) -> crate::error::Result<bool> {
        let decision = if allow {
            Decision::Allow
        } else {
            Decision::Deny {
                reason: DenyReason::User,
                rationale,
            }
        };
        self.resolve(approval_id, decision).await
    }

    /// Reject every pending approval for a session key.
    pub async fn cancel_all_for(
        &self,
        session_key: &str,
        reason: DenyReason,
    ) -> crate::error::Result<()> {
        let ids: Vec<Uuid> = self
            .lock()
            .iter()
            .filter(|(_, p)| p.session_key == session_key)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.resolve(
                id,
                Decision::Deny {
                    reason,
                    rationale: None,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Number of pending approvals (for tests and introspection).
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    // ── Resolution ────────────────────────────────────────────────────────────

    /// Single resolution path. First caller for an id wins; the pending is
    /// removed before any await so duplicates observe an empty slot.
    async fn resolve(&self, approval_id: Uuid, decision: Decision) -> crate::error::Result<bool> {
        let Some(pending) = self.lock().remove(&approval_id) else {
            debug!(%approval_id, "decision for unknown or already-resolved approval ignored");
            return Ok(false);
        };

        if let Decision::Deny { reason, rationale } = &decision {
            let data = serde_json::json!({
                "callId": pending.call_id,
                "toolName": pending.tool_name,
                "denied": true,
                "reason": reason,
                "rationale": rationale,
            });
            self.events
                .append(
                    &pending.session_key,
                    StreamEventKind::ToolUseResult,
                    &data.to_string(),
                )
                .await?;
        }

        // The requester may have timed out and gone; that is fine.
        let _ = pending.tx.send(decision);
        Ok(true)
    }

    async fn append_request_event(
        &self,
        approval_id: Uuid,
        session_key: &str,
        call_id: &str,
        tool_name: &str,
        args: &serde_json::Value,
        tier: Tier,
    ) -> crate::error::Result<()> {
        let data = serde_json::json!({
            "approvalId": approval_id,
            "callId": call_id,
            "toolName": tool_name,
            "args": args,
            "tier": tier,
        });
        self.events
            .append(session_key, StreamEventKind::ApprovalRequest, &data.to_string())
            .await?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
