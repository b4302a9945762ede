// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Background retention sweeper.
//!
//! Runs [`Gateway::sweep_once`] on a fixed interval.  Sweep failures are
//! logged and retried next tick — retention is best effort, unlike
//! producer-event appends.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::Gateway;

/// Run the sweep loop until `shutdown` fires.
pub async fn run(gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let period = Duration::from_secs(gateway.config().retention.sweep_interval_secs);
    let mut interval = tokio::time::interval(period);
    // The immediate first tick would sweep at startup; skip it.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("sweeper stopped");
                return;
            }
            _ = interval.tick() => {
                match gateway.sweep_once() {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "retention sweep"),
                    Err(e) => warn!("retention sweep failed: {e}"),
                }
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
