// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Workspace bootstrap files.
//!
//! A known set of markdown files at the workspace root is injected into the
//! system prompt's Project Context block.  Main and named sessions load the
//! full set; subagent sessions load only the files that describe the
//! environment, not the persona.  Oversized files are truncated head+tail
//! with a marker so one runaway file cannot displace the conversation.

use std::path::Path;

use runa_session::SessionTail;
use tracing::debug;

/// Files loaded for main and named sessions, in injection order.
pub const BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "MEMORY.md",
    "HEARTBEAT.md",
    "IDENTITY.md",
    "TOOLS.md",
    "BOOTSTRAP.md",
];

/// Reduced set for subagent sessions.
pub const SUBAGENT_BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "TOOLS.md"];

/// Per-file char cap before head+tail truncation applies.
pub const MAX_BOOTSTRAP_FILE_CHARS: usize = 24_000;

/// Truncate `s` to roughly `max` chars, keeping an even head and tail
/// around a marker line.
pub fn truncate_head_tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let keep = max / 2;
    let mut head_end = keep.min(s.len());
    while head_end > 0 && !s.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = s.len() - keep.min(s.len());
    while tail_start < s.len() && !s.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let omitted = tail_start.saturating_sub(head_end);
    format!(
        "{}\n[... {omitted} chars truncated ...]\n{}",
        &s[..head_end],
        &s[tail_start..]
    )
}

/// Which bootstrap files apply to a session of the given kind.
pub fn bootstrap_files_for(tail: &SessionTail) -> &'static [&'static str] {
    match tail {
        SessionTail::Subagent(_) => SUBAGENT_BOOTSTRAP_FILES,
        _ => BOOTSTRAP_FILES,
    }
}

/// Load and concatenate the bootstrap files present in `workspace`.
/// Returns `None` when none of them exist or all are empty.
pub fn load_bootstrap(workspace: &Path, tail: &SessionTail) -> Option<String> {
    let mut out = String::new();
    for name in bootstrap_files_for(tail) {
        let path = workspace.join(name);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }
        debug!(file = name, chars = raw.len(), "loading bootstrap file");
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "### {name}\n\n{}",
            truncate_head_tail(raw.trim_end(), MAX_BOOTSTRAP_FILE_CHARS)
        ));
    }
    (!out.is_empty()).then_some(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
