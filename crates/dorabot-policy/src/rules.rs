// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The rule table.
//!
//! Everything the classifier consults lives in this file as plain data so a
//! test (or a curious operator) can read the policy without tracing code
//! paths.  Order matters: shell commands are screened first, then the
//! side-effect tool groups, then the auto-allow fallback.

/// Tools that execute a shell command carried in an `command` argument.
pub const SHELL_TOOLS: &[&str] = &["bash", "shell", "exec", "run_command"];

/// Command patterns that always require approval when they appear in a
/// shell tool's `command` string.  Matched case-insensitively, unanchored.
pub const DESTRUCTIVE_COMMAND_PATTERNS: &[&str] = &[
    // recursive deletion
    r"\brm\s+(-[a-z]*[rf][a-z]*\s+)+",
    // filesystem formatting
    r"\bmkfs(\.\w+)?\b",
    // raw disk writes
    r"\bdd\s+[^|]*\bof=/dev/",
    r">\s*/dev/sd[a-z]",
    // piped-to-shell installers
    r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba)?sh\b",
    // permission weakening
    r"\bchmod\s+([a-z+]*\s+)?0?777\b",
    r"\bchmod\s+-R\b",
    // fork bomb
    r":\(\)\s*\{\s*:\|:&\s*\}\s*;",
    // power management
    r"\b(shutdown|reboot|poweroff|halt)\b",
    // privilege escalation
    r"\bsudo\b",
    r"\bsu\s+-",
    // package publish / unpublish
    r"\b(npm|pnpm|yarn)\s+(publish|unpublish)\b",
    r"\bcargo\s+(publish|yank)\b",
    r"\bgem\s+push\b",
    r"\btwine\s+upload\b",
    // destructive VCS operations
    r"\bgit\s+push\s+[^|]*(--force|-f)\b",
    r"\bgit\s+reset\s+--hard\b",
    r"\bgit\s+clean\s+-[a-z]*f",
    r"\bgit\s+branch\s+-D\b",
];

/// Tools that modify files in place.
pub const FILE_MODIFYING_TOOLS: &[&str] = &[
    "write",
    "write_file",
    "edit",
    "edit_file",
    "apply_patch",
    "delete_file",
    "move_file",
];

/// Tools that message the outside world.
pub const MESSAGING_TOOLS: &[&str] = &[
    "send_message",
    "send_email",
    "post_message",
    "reply",
];

/// Browser-automation tools are matched by prefix.
pub const BROWSER_TOOL_PREFIXES: &[&str] = &["browser_", "page_"];

/// Scheduling tools create deferred side effects.
pub const SCHEDULING_TOOLS: &[&str] = &[
    "schedule",
    "cron_create",
    "cron_update",
    "cron_delete",
];
