// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket endpoint — one socket per client, three tasks per socket.
//!
//! ```text
//!   reader (this fn)  ──► router::handle_text ──► outbound queue ─┐
//!   live pump         ──► subscription filter ──► outbound queue ─┤
//!                                                                  ▼
//!                                              writer task ──► socket
//! ```
//!
//! # Security
//!
//! The socket upgrades before authentication; the first frame must be a
//! successful `auth` within the grace window or the connection is closed.
//! Every later method checks the authed flag in the router.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::gateway::Gateway;
use crate::rpc::router;
use crate::rpc::subscriptions::{self, OutboundFrame};

/// HTTP handler for GET /ws.
pub async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

/// Drive one client socket until it closes.
pub async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let (conn, mut outbound_rx) = gateway.register_connection();
    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbound queue onto the socket. On teardown the
    // remaining queued frames (e.g. the auth error) are flushed first.
    let writer_closed = conn.closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_closed.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if send_frame(&mut sink, frame).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
        while let Ok(frame) = outbound_rx.try_recv() {
            if send_frame(&mut sink, frame).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    // Live fan-out for this connection.
    tokio::spawn(subscriptions::pump_live(
        gateway.clone(),
        conn.clone(),
        gateway.events().subscribe(),
    ));

    // Reader. Unauthenticated sockets get a short grace window.
    let grace = Duration::from_secs(gateway.config().limits.auth_grace_secs);
    let auth_deadline = tokio::time::sleep(grace);
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => break,
            _ = &mut auth_deadline, if !conn.is_authed() => {
                warn!(conn = %conn.id, "auth grace window expired");
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = router::handle_text(&gateway, &conn, &text).await;
                        if conn.push(OutboundFrame::Text(response)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if conn.push(OutboundFrame::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(conn = %conn.id, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    gateway.release_connection(&conn).await;
    let _ = writer.await;
}

async fn send_frame(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    frame: OutboundFrame,
) -> Result<(), axum::Error> {
    match frame {
        OutboundFrame::Text(text) => sink.send(Message::Text(text)).await,
        OutboundFrame::Pong(data) => sink.send(Message::Pong(data)).await,
    }
}
