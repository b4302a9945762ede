// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bearer token generation and storage.
//!
//! # Security model
//!
//! The gateway is single-user and loopback-only; its clients are other
//! processes of the same user.  They authenticate with a 256-bit hex token
//! written once to `<base>/gateway-token` with mode `0o600` — readable by
//! the owning user, nobody else.  Clients read the file directly; no
//! pairing flow is needed.
//!
//! Comparisons never touch the raw strings: both sides are hashed with
//! SHA-256 and the digests compared via [`subtle::ConstantTimeEq`], so a
//! local observer cannot use response timing as an oracle.

use std::path::Path;

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

/// The gateway's bearer token, held in memory as its SHA-256 digest.
#[derive(Debug, Clone)]
pub struct GatewayToken {
    digest: [u8; 32],
}

impl GatewayToken {
    /// Load the token from `path`, generating and persisting a fresh one
    /// when the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading token file {}", path.display()))?;
            return Ok(Self::from_raw(raw.trim()));
        }
        let raw = Self::generate_raw();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating token directory {}", parent.display()))?;
        }
        write_secret_file(path, raw.as_bytes())?;
        info!(token_file = %path.display(), "generated gateway token");
        Ok(Self::from_raw(&raw))
    }

    /// Generate and persist a new token, invalidating the old one.
    /// Returns the raw token so the caller can display it.
    pub fn regenerate(path: &Path) -> anyhow::Result<String> {
        let raw = Self::generate_raw();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating token directory {}", parent.display()))?;
        }
        write_secret_file(path, raw.as_bytes())?;
        Ok(raw)
    }

    /// Build from a known raw token (tests, in-memory gateways).
    pub fn from_raw(raw: &str) -> Self {
        Self {
            digest: Sha256::digest(raw.as_bytes()).into(),
        }
    }

    /// Verify a presented token in constant time.
    pub fn verify(&self, provided: &str) -> bool {
        let provided_digest: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
        bool::from(provided_digest.ct_eq(&self.digest))
    }

    /// 64 lowercase hex characters from the OS CSPRNG.
    fn generate_raw() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Write `data` to `path` with mode 0o600 on Unix (owner read/write only).
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
