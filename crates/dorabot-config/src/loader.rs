// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Layered YAML loader.
//!
//! Layers are **deep-merged** — a file may override only the fields it
//! cares about.  Search order (later overrides earlier):
//! 1. `/etc/dorabot/gateway.yaml`
//! 2. `~/.dorabot/gateway.yaml`
//! 3. Path given to [`load`] explicitly.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::GatewayConfig;

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/dorabot/gateway.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".dorabot/gateway.yaml"));
    }
    paths
}

pub fn load(extra: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading gateway config layer");
            merge_file(&mut merged, &path)?;
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit gateway config");
        merge_file(&mut merged, p)?;
    }

    let config: GatewayConfig = if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty())
    {
        GatewayConfig::default()
    } else {
        serde_yaml::from_value(merged).context("interpreting merged gateway config")?
    };
    Ok(config)
}

fn merge_file(dst: &mut serde_yaml::Value, path: &Path) -> anyhow::Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(dst, layer);
    Ok(())
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
