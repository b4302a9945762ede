// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway configuration schema.
//!
//! Configuration is YAML (never TOML).  **All defaults are production-safe**:
//! loopback bind, TLS on, one-hour event retention, ten-minute approval
//! expiry.  A gateway started with no config file at all is fully usable.
//!
//! # Example full config
//! ```yaml
//! base_dir: ~/.dorabot
//!
//! http:
//!   bind: "127.0.0.1:18789"
//!
//! retention:
//!   max_age_secs: 3600
//!   sweep_interval_secs: 300
//!
//! approvals:
//!   require_timeout_secs: 600
//!
//! limits:
//!   replay_page: 2000
//!   outbound_queue: 10000
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_http_bind() -> String {
    "127.0.0.1:18789".to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base directory for all persisted state. Default: `~/.dorabot`.
    pub base_dir: Option<PathBuf>,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub approvals: ApprovalsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl GatewayConfig {
    /// Resolved base directory. Tilde-free: `base_dir` is taken verbatim if
    /// set, otherwise `~/.dorabot`.
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dorabot")
        })
    }

    /// `<base>/dorabot.db` — the embedded SQL store.
    pub fn db_path(&self) -> PathBuf {
        self.base_dir().join("dorabot.db")
    }

    /// `<base>/gateway-token` — the 256-bit hex bearer token.
    pub fn token_path(&self) -> PathBuf {
        self.base_dir().join("gateway-token")
    }

    /// `<base>/tls/` — self-signed certificate and private key.
    pub fn tls_dir(&self) -> PathBuf {
        self.base_dir().join("tls")
    }

    /// `<base>/logs/` — rotated log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir().join("logs")
    }
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on. Default: `127.0.0.1:18789` (loopback only).
    /// The gateway is single-user and local-first; it never binds a
    /// routable address.
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

/// Event-log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Events older than this are eligible for the sweep. Default: 3600 s.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// How often the background sweeper runs. Default: 300 s.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_age() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    300
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Approval expiry, configurable per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    /// How long a `require-approval` request may stay pending before it
    /// defaults to deny with reason `timeout`. Default: 600 s.
    #[serde(default = "default_require_timeout")]
    pub require_timeout_secs: u64,

    /// Expiry for the `notify` tier. Notify never blocks the producer, so
    /// this only bounds how long the pending record is retained; kept so
    /// the two tiers stay symmetric. Default: 0 (no record kept).
    #[serde(default)]
    pub notify_timeout_secs: u64,
}

fn default_require_timeout() -> u64 {
    600
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            require_timeout_secs: default_require_timeout(),
            notify_timeout_secs: 0,
        }
    }
}

/// Queue and paging bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Replay page size for `sessions.subscribe`. Default: 2000.
    #[serde(default = "default_replay_page")]
    pub replay_page: usize,

    /// Per-connection outbound queue bound. A connection whose queue
    /// overflows is closed with `ErrSlowConsumer`. Default: 10 000.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Seconds an unauthenticated connection may linger before it is
    /// closed. Default: 10.
    #[serde(default = "default_auth_grace")]
    pub auth_grace_secs: u64,
}

fn default_replay_page() -> usize {
    2000
}
fn default_outbound_queue() -> usize {
    10_000
}
fn default_auth_grace() -> u64 {
    10
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            replay_page: default_replay_page(),
            outbound_queue: default_outbound_queue(),
            auth_grace_secs: default_auth_grace(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
