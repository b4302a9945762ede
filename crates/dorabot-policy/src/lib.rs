// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tool approval policy.
//!
//! A pure classifier mapping `(tool name, arguments)` to an approval tier.
//! The rule set is data ([`rules`]), not code paths; [`ToolPolicy::classify`]
//! only walks it.  Arguments are opaque JSON — the classifier looks at a
//! single field, `command`, and only for shell tools.

pub mod rules;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Approval tier for one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Run without asking.
    AutoAllow,
    /// Surface an event to subscribers but do not block the producer.
    /// Reserved for policy configuration; the default rule set never
    /// produces it.
    Notify,
    /// Park the invocation until an operator decides.
    RequireApproval,
}

/// Compiled policy engine. Construct once, classify many times.
#[derive(Debug)]
pub struct ToolPolicy {
    destructive: RegexSet,
}

impl ToolPolicy {
    pub fn new() -> Self {
        // The pattern table is fixed data; it must compile.
        let destructive = RegexSet::new(
            rules::DESTRUCTIVE_COMMAND_PATTERNS
                .iter()
                .map(|p| format!("(?i){p}")),
        )
        .unwrap_or_else(|e| panic!("destructive pattern table does not compile: {e}"));
        Self { destructive }
    }

    /// Classify one tool invocation. Pure: same inputs, same tier.
    pub fn classify(&self, tool_name: &str, args: &serde_json::Value) -> Tier {
        let name = normalize_tool_name(tool_name);

        if rules::SHELL_TOOLS.contains(&name.as_str()) {
            let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
            if self.destructive.is_match(command) {
                return Tier::RequireApproval;
            }
            return Tier::AutoAllow;
        }

        if rules::FILE_MODIFYING_TOOLS.contains(&name.as_str())
            || rules::MESSAGING_TOOLS.contains(&name.as_str())
            || rules::SCHEDULING_TOOLS.contains(&name.as_str())
            || rules::BROWSER_TOOL_PREFIXES
                .iter()
                .any(|p| name.starts_with(p))
        {
            return Tier::RequireApproval;
        }

        Tier::AutoAllow
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip an `mcp__<server>__` prefix and lowercase the remainder, so
/// `mcp__files__Write` and `Write` classify identically.
fn normalize_tool_name(name: &str) -> String {
    let stripped = name
        .strip_prefix("mcp__")
        .and_then(|rest| rest.split_once("__").map(|(_, tool)| tool))
        .unwrap_or(name);
    stripped.to_ascii_lowercase()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
