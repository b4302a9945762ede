// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire protocol between clients and the gateway.
//!
//! JSON over WebSocket text frames.  Requests carry a client-chosen `id`
//! that the response echoes verbatim; server-pushed event notifications
//! have no `id`:
//!
//! ```text
//! → {"method": "sessions.subscribe", "params": {...}, "id": 7}
//! ← {"id": 7, "result": {...}}
//! ← {"method": "event", "params": {"sessionKey": "...", "seq": 42,
//!    "eventType": "agent.stream", "data": "..."}}
//! ```
//!
//! Error responses use a closed code set ([`ErrorCode`]); clients can match
//! on the code string without parsing messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// One request frame. `id` is whatever JSON value the client chose.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One response frame: exactly one of `result` / `error` is present.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: &GatewayError) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: error.code(),
                message: error.to_string(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The closed error-code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ErrUnauthenticated")]
    Unauthenticated,
    #[serde(rename = "ErrUnknownMethod")]
    UnknownMethod,
    #[serde(rename = "ErrInvalidParams")]
    InvalidParams,
    #[serde(rename = "ErrNotFound")]
    NotFound,
    #[serde(rename = "ErrBusy")]
    Busy,
    #[serde(rename = "ErrPersistence")]
    Persistence,
    #[serde(rename = "ErrSlowConsumer")]
    SlowConsumer,
    #[serde(rename = "ErrInternal")]
    Internal,
}

/// Server-pushed notification for one appended event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventParams {
    pub session_key: String,
    pub seq: i64,
    pub event_type: String,
    /// Opaque producer-defined JSON string, forwarded unchanged.
    pub data: String,
}

/// Serialize one event notification frame.
pub fn event_frame(params: &EventParams) -> String {
    // EventParams serialization cannot fail: strings and integers only.
    serde_json::json!({ "method": "event", "params": params }).to_string()
}

// ── Method params ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParam {
    pub session_key: String,
    #[serde(default)]
    pub after_seq: i64,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    pub subscriptions: Vec<SubscriptionParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    pub session_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetActiveParams {
    pub session_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    /// Omitted for channel-less follow-ups; the connection's focused
    /// session is used instead.
    pub session_key: Option<String>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortParams {
    pub session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideParams {
    pub approval_id: uuid::Uuid,
    pub decision: DecisionParam,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionParam {
    Allow,
    Deny,
}

#[derive(Debug, Deserialize)]
pub struct AckParams {
    pub seq: i64,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_defaulted_fields() {
        let req: RpcRequest = serde_json::from_str(r#"{"method": "auth"}"#).unwrap();
        assert_eq!(req.method, "auth");
        assert!(req.id.is_null());
        assert!(req.params.is_null());
    }

    #[test]
    fn response_echoes_client_chosen_id() {
        let resp = RpcResponse::ok(serde_json::json!("req-9"), serde_json::json!({"ok": true}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"req-9\""));
        assert!(!text.contains("error"));
    }

    #[test]
    fn error_codes_serialize_with_err_prefix() {
        let resp = RpcResponse::err(
            serde_json::json!(1),
            &GatewayError::Busy("k".to_string()),
        );
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"ErrBusy\""), "{text}");
        assert!(!text.contains("result"));
    }

    #[test]
    fn event_frame_uses_camel_case_params() {
        let frame = event_frame(&EventParams {
            session_key: "a:b:c".to_string(),
            seq: 42,
            event_type: "agent.stream".to_string(),
            data: "{}".to_string(),
        });
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "event");
        assert_eq!(v["params"]["sessionKey"], "a:b:c");
        assert_eq!(v["params"]["seq"], 42);
        assert_eq!(v["params"]["eventType"], "agent.stream");
    }

    #[test]
    fn subscribe_params_default_after_seq_to_zero() {
        let p: SubscribeParams = serde_json::from_str(
            r#"{"subscriptions": [{"sessionKey": "k"}, {"sessionKey": "j", "afterSeq": 7}]}"#,
        )
        .unwrap();
        assert_eq!(p.subscriptions[0].after_seq, 0);
        assert_eq!(p.subscriptions[1].after_seq, 7);
    }

    #[test]
    fn decide_params_parse_both_decisions() {
        let allow: DecideParams = serde_json::from_str(&format!(
            r#"{{"approvalId": "{}", "decision": "allow"}}"#,
            uuid::Uuid::new_v4()
        ))
        .unwrap();
        assert_eq!(allow.decision, DecisionParam::Allow);

        let deny: DecideParams = serde_json::from_str(&format!(
            r#"{{"approvalId": "{}", "decision": "deny", "rationale": "nope"}}"#,
            uuid::Uuid::new_v4()
        ))
        .unwrap();
        assert_eq!(deny.decision, DecisionParam::Deny);
        assert_eq!(deny.rationale.as_deref(), Some("nope"));
    }
}
