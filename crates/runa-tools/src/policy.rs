// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use runa_config::{SandboxConfig, ToolPatternConfig};

/// Glob allow/deny policy over tool names.
///
/// Deny overrides allow.  An empty allow list means "allow everything that is
/// not denied".
#[derive(Debug, Default)]
pub struct ToolPolicy {
    allow_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            allow_patterns: compile(allow),
            deny_patterns: compile(deny),
        }
    }

    pub fn from_config(cfg: &ToolPatternConfig) -> Self {
        Self::new(&cfg.allow, &cfg.deny)
    }

    /// Policy that admits every tool.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny-only policy derived from sandbox settings: exec-style tools are
    /// removed when exec is disabled, write/edit tools when writes are
    /// disabled.  A disabled sandbox denies nothing.
    pub fn from_sandbox(sandbox: &SandboxConfig) -> Self {
        let mut deny: Vec<String> = Vec::new();
        if sandbox.enabled {
            if !sandbox.allow_exec {
                deny.push("exec".into());
            }
            if !sandbox.allow_write {
                deny.push("write".into());
                deny.push("edit".into());
            }
        }
        Self::new(&[], &deny)
    }

    /// Decide whether `tool` passes this policy layer.
    pub fn is_allowed(&self, tool: &str) -> bool {
        if self.deny_patterns.iter().any(|re| re.is_match(tool)) {
            return false;
        }
        if self.allow_patterns.is_empty() {
            return true;
        }
        self.allow_patterns.iter().any(|re| re.is_match(tool))
    }
}

/// A tool passes only when it passes every policy layer.
pub fn allowed_by_all(tool: &str, layers: &[&ToolPolicy]) -> bool {
    layers.iter().all(|p| p.is_allowed(tool))
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
