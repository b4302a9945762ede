// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! RPC method dispatch.
//!
//! Every text frame becomes exactly one response frame.  `auth` must come
//! first; until it succeeds every other method is rejected with
//! `ErrUnauthenticated`.  A failed `auth` closes the connection after the
//! error is sent.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use dorabot_agent::UserTurn;

use crate::gateway::Gateway;
use crate::rpc::protocol::{
    AbortParams, AckParams, AuthParams, DecideParams, DecisionParam, RpcRequest, RpcResponse,
    SetActiveParams, StartParams, SubscribeParams, UnsubscribeParams,
};
use crate::rpc::subscriptions::{self, Connection};
use crate::GatewayError;

/// Handle one inbound text frame; returns the serialized response.
pub async fn handle_text(gateway: &Arc<Gateway>, conn: &Arc<Connection>, text: &str) -> String {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(conn = %conn.id, "malformed request frame: {e}");
            let err = GatewayError::InvalidParams(format!("malformed request: {e}"));
            return serialize(RpcResponse::err(Value::Null, &err));
        }
    };

    let id = request.id.clone();
    match dispatch(gateway, conn, request).await {
        Ok(result) => serialize(RpcResponse::ok(id, result)),
        Err(e) => serialize(RpcResponse::err(id, &e)),
    }
}

fn serialize(response: RpcResponse) -> String {
    serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"id":null,"error":{"code":"ErrInternal","message":"unserializable response"}}"#.to_string())
}

async fn dispatch(
    gateway: &Arc<Gateway>,
    conn: &Arc<Connection>,
    request: RpcRequest,
) -> crate::error::Result<Value> {
    if !conn.is_authed() && request.method != "auth" {
        return Err(GatewayError::Unauthenticated);
    }

    match request.method.as_str() {
        "auth" => auth(gateway, conn, request.params),
        "sessions.list" => sessions_list(gateway),
        "sessions.subscribe" => sessions_subscribe(gateway, conn, request.params).await,
        "sessions.unsubscribe" => sessions_unsubscribe(conn, request.params).await,
        "sessions.set-active" => sessions_set_active(gateway, conn, request.params),
        "agent.start" => agent_start(gateway, conn, request.params).await,
        "agent.abort" => agent_abort(gateway, conn, request.params).await,
        "agent.approval.decide" => approval_decide(gateway, request.params).await,
        "events.ack" => events_ack(conn, request.params),
        other => Err(GatewayError::UnknownMethod(other.to_string())),
    }
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> crate::error::Result<T> {
    serde_json::from_value(value).map_err(|e| GatewayError::InvalidParams(e.to_string()))
}

// ── Methods ───────────────────────────────────────────────────────────────────

fn auth(
    gateway: &Arc<Gateway>,
    conn: &Arc<Connection>,
    raw: Value,
) -> crate::error::Result<Value> {
    let p: AuthParams = params(raw)?;
    if !gateway.token().verify(&p.token) {
        warn!(conn = %conn.id, "bearer token rejected");
        // The ws loop closes the socket once the error frame is out.
        conn.closed.cancel();
        return Err(GatewayError::Unauthenticated);
    }
    conn.set_authed();
    info!(conn = %conn.id, "client authenticated");
    Ok(json!({ "ok": true }))
}

fn sessions_list(gateway: &Arc<Gateway>) -> crate::error::Result<Value> {
    let sessions = gateway.registry().list()?;
    Ok(json!({ "sessions": sessions }))
}

async fn sessions_subscribe(
    gateway: &Arc<Gateway>,
    conn: &Arc<Connection>,
    raw: Value,
) -> crate::error::Result<Value> {
    let p: SubscribeParams = params(raw)?;
    let subscriptions: Vec<(String, i64)> = p
        .subscriptions
        .into_iter()
        .map(|s| (s.session_key, s.after_seq))
        .collect();
    let replayed = subscriptions::subscribe_and_replay(gateway, conn, subscriptions).await?;
    Ok(json!({ "replayed": replayed }))
}

async fn sessions_unsubscribe(
    conn: &Arc<Connection>,
    raw: Value,
) -> crate::error::Result<Value> {
    let p: UnsubscribeParams = params(raw)?;
    subscriptions::unsubscribe(conn, &p.session_keys).await;
    Ok(json!({ "ok": true }))
}

fn sessions_set_active(
    gateway: &Arc<Gateway>,
    conn: &Arc<Connection>,
    raw: Value,
) -> crate::error::Result<Value> {
    let p: SetActiveParams = params(raw)?;
    gateway.registry().get_or_create(&p.session_key)?;
    conn.set_active_session(Some(p.session_key));
    Ok(json!({ "ok": true }))
}

async fn agent_start(
    gateway: &Arc<Gateway>,
    conn: &Arc<Connection>,
    raw: Value,
) -> crate::error::Result<Value> {
    let p: StartParams = params(raw)?;
    let session_key = resolve_session_key(conn, p.session_key)?;
    let run_id = gateway
        .supervisor()
        .start(&session_key, UserTurn::new(p.text))
        .await?;
    Ok(json!({ "runId": run_id, "sessionKey": session_key }))
}

async fn agent_abort(
    gateway: &Arc<Gateway>,
    conn: &Arc<Connection>,
    raw: Value,
) -> crate::error::Result<Value> {
    let p: AbortParams = params(raw)?;
    let session_key = resolve_session_key(conn, p.session_key)?;
    let aborted = gateway.supervisor().abort(&session_key).await?;
    Ok(json!({ "aborted": aborted }))
}

async fn approval_decide(gateway: &Arc<Gateway>, raw: Value) -> crate::error::Result<Value> {
    let p: DecideParams = params(raw)?;
    let allow = p.decision == DecisionParam::Allow;
    let resolved = gateway
        .approvals()
        .decide(p.approval_id, allow, p.rationale)
        .await?;
    Ok(json!({ "resolved": resolved }))
}

fn events_ack(conn: &Arc<Connection>, raw: Value) -> crate::error::Result<Value> {
    let p: AckParams = params(raw)?;
    conn.ack(p.seq);
    Ok(json!({ "ackedSeq": conn.acked_seq() }))
}

/// Explicit key, or the connection's focused session for channel-less
/// follow-ups.
fn resolve_session_key(
    conn: &Arc<Connection>,
    explicit: Option<String>,
) -> crate::error::Result<String> {
    explicit
        .or_else(|| conn.active_session())
        .ok_or_else(|| {
            GatewayError::InvalidParams(
                "sessionKey missing and no active session set".to_string(),
            )
        })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dorabot_agent::MockProducer;
    use dorabot_config::GatewayConfig;
    use dorabot_store::Store;

    use crate::crypto::GatewayToken;

    const TOKEN: &str = "sesame";

    fn gateway() -> Arc<Gateway> {
        Gateway::new(
            GatewayConfig::default(),
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(MockProducer::trivial()),
            GatewayToken::from_raw(TOKEN),
        )
    }

    async fn call(gateway: &Arc<Gateway>, conn: &Arc<Connection>, frame: &str) -> Value {
        let response = handle_text(gateway, conn, frame).await;
        serde_json::from_str(&response).unwrap()
    }

    async fn authed_conn(gateway: &Arc<Gateway>) -> Arc<Connection> {
        let (conn, _rx) = gateway.register_connection();
        let v = call(
            gateway,
            &conn,
            &format!(r#"{{"id": 1, "method": "auth", "params": {{"token": "{TOKEN}"}}}}"#),
        )
        .await;
        assert_eq!(v["result"]["ok"], true);
        conn
    }

    #[tokio::test]
    async fn methods_before_auth_are_rejected() {
        let gw = gateway();
        let (conn, _rx) = gw.register_connection();
        let v = call(&gw, &conn, r#"{"id": 1, "method": "sessions.list"}"#).await;
        assert_eq!(v["error"]["code"], "ErrUnauthenticated");
    }

    #[tokio::test]
    async fn bad_token_errors_and_closes() {
        let gw = gateway();
        let (conn, _rx) = gw.register_connection();
        let v = call(
            &gw,
            &conn,
            r#"{"id": 1, "method": "auth", "params": {"token": "wrong"}}"#,
        )
        .await;
        assert_eq!(v["error"]["code"], "ErrUnauthenticated");
        assert!(conn.closed.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;
        let v = call(&gw, &conn, r#"{"id": 2, "method": "sessions.evaporate"}"#).await;
        assert_eq!(v["error"]["code"], "ErrUnknownMethod");
        assert_eq!(v["id"], 2, "id must be echoed");
    }

    #[tokio::test]
    async fn malformed_json_yields_invalid_params() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;
        let v = call(&gw, &conn, "{not json").await;
        assert_eq!(v["error"]["code"], "ErrInvalidParams");
    }

    #[tokio::test]
    async fn start_without_key_uses_active_session() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;

        let v = call(
            &gw,
            &conn,
            r#"{"id": 3, "method": "sessions.set-active", "params": {"sessionKey": "cli:dm:me"}}"#,
        )
        .await;
        assert_eq!(v["result"]["ok"], true);

        let v = call(
            &gw,
            &conn,
            r#"{"id": 4, "method": "agent.start", "params": {"text": "hello"}}"#,
        )
        .await;
        assert_eq!(v["result"]["sessionKey"], "cli:dm:me");
        assert!(v["result"]["runId"].is_string());
    }

    #[tokio::test]
    async fn start_without_any_session_is_invalid() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;
        let v = call(
            &gw,
            &conn,
            r#"{"id": 5, "method": "agent.start", "params": {"text": "hello"}}"#,
        )
        .await;
        assert_eq!(v["error"]["code"], "ErrInvalidParams");
    }

    #[tokio::test]
    async fn ack_advances_high_water_mark() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;
        let v = call(
            &gw,
            &conn,
            r#"{"id": 6, "method": "events.ack", "params": {"seq": 41}}"#,
        )
        .await;
        assert_eq!(v["result"]["ackedSeq"], 41);
        assert_eq!(conn.acked_seq(), 41);
    }

    #[tokio::test]
    async fn list_reflects_created_sessions() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;
        call(
            &gw,
            &conn,
            r#"{"id": 7, "method": "sessions.set-active", "params": {"sessionKey": "a:b:c"}}"#,
        )
        .await;
        let v = call(&gw, &conn, r#"{"id": 8, "method": "sessions.list"}"#).await;
        let sessions = v["result"]["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["sessionKey"], "a:b:c");
    }

    #[tokio::test]
    async fn decide_for_unknown_approval_reports_unresolved() {
        let gw = gateway();
        let conn = authed_conn(&gw).await;
        let v = call(
            &gw,
            &conn,
            &format!(
                r#"{{"id": 9, "method": "agent.approval.decide",
                     "params": {{"approvalId": "{}", "decision": "deny"}}}}"#,
                uuid::Uuid::new_v4()
            ),
        )
        .await;
        assert_eq!(v["result"]["resolved"], false);
    }
}
