// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTPS/WebSocket server wiring.

pub mod tls;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::gateway::Gateway;
use tls::TlsRuntime;

/// Serve `wss://<bind>/ws` until shutdown. Blocks.
pub async fn serve(gateway: Arc<Gateway>, tls: &TlsRuntime) -> anyhow::Result<()> {
    let bind = gateway.config().http.bind.clone();
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(gateway);

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .context("loading TLS certificate for the listener")?;

    info!(%addr, fingerprint = %tls.fingerprint_sha256, "gateway listening (wss)");
    axum_server::bind_rustls(addr, rustls)
        .serve(app.into_make_service())
        .await
        .context("HTTP server failed")?;
    Ok(())
}
