// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway startup — assembles all subsystems and starts them.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order:
//!
//! 1. Resolve the base directory and create it.
//! 2. Open the embedded store (`dorabot.db`, WAL) and migrate its schema.
//! 3. Load or generate the TLS certificate under `tls/`.
//! 4. Load or generate the bearer token at `gateway-token`.
//! 5. Construct the [`Gateway`] value.
//! 6. Spawn the retention sweeper.
//! 7. Serve the wss listener (blocks until shutdown).
//! 8. On shutdown, abort all active runs.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dorabot_agent::AgentProducer;
use dorabot_config::GatewayConfig;
use dorabot_store::Store;

use crate::crypto::GatewayToken;
use crate::gateway::Gateway;
use crate::{http, sweeper};

/// Start the gateway. This is the single entry point for `dorabot gateway
/// start`; `producer` is the agent driver the supervisor will spawn runs
/// with.
pub async fn run(config: GatewayConfig, producer: Arc<dyn AgentProducer>) -> anyhow::Result<()> {
    let base_dir = config.base_dir();
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("creating base directory {}", base_dir.display()))?;
    std::fs::create_dir_all(config.logs_dir())
        .with_context(|| format!("creating logs directory under {}", base_dir.display()))?;
    info!(base = %base_dir.display(), "starting dorabot gateway");

    let store = Arc::new(Store::open(&config.db_path())?);
    let tls = http::tls::load_or_generate(&config.tls_dir())?;
    let token = GatewayToken::load_or_generate(&config.token_path())?;

    let gateway = Gateway::new(config, store, producer, token);

    let shutdown = CancellationToken::new();
    tokio::spawn(sweeper::run(gateway.clone(), shutdown.clone()));

    let served = http::serve(gateway.clone(), &tls).await;

    shutdown.cancel();
    gateway.supervisor().abort_all().await?;
    served
}

/// Regenerate the bearer token, printing the new value once. The old token
/// is immediately invalidated.
pub fn regenerate_token(config: &GatewayConfig) -> anyhow::Result<()> {
    let raw = GatewayToken::regenerate(&config.token_path())?;
    println!("New gateway token (also written to {}):", config.token_path().display());
    println!("  {raw}");
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regenerate_token_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            base_dir: Some(dir.path().to_path_buf()),
            ..GatewayConfig::default()
        };
        regenerate_token(&config).unwrap();
        assert!(config.token_path().exists());
    }

    #[test]
    fn base_dir_layout_matches_contract() {
        let config = GatewayConfig {
            base_dir: Some(Path::new("/tmp/d").to_path_buf()),
            ..GatewayConfig::default()
        };
        assert!(config.db_path().ends_with("dorabot.db"));
        assert!(config.token_path().ends_with("gateway-token"));
        assert!(config.tls_dir().ends_with("tls"));
    }
}
