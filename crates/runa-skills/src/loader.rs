// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill discovery and parsing.
//!
//! A skill is a **directory** that contains a `SKILL.md` file with YAML
//! front-matter:
//!
//! ```markdown
//! ---
//! name: Git Workflow        # optional — falls back to the directory name
//! description: |            # required — skills without one are skipped
//!   Use when the user asks about branching or commits.
//! user-invocable: true              # default true
//! disable-model-invocation: false   # default false
//! ---
//!
//! # Skill body here…
//! ```
//!
//! Discovery scans a list of root directories from lowest to highest
//! precedence (global, managed, workspace); a later root wins when two
//! skills share a name.  The body is never loaded into the prompt — the
//! model reads the skill file through its `read` tool when it decides to
//! use the skill.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::command::sanitize_command_name;

pub(crate) const MAX_SKILL_FILE_BYTES: u64 = 256 * 1024; // 256 KB

/// A fully parsed and validated skill.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    /// Display name from front-matter, or the directory name.
    pub name: String,
    /// Required description (should contain trigger phrases).
    pub description: String,
    /// Slash-command alias derived from the name; unique within a set.
    pub command: String,
    /// Absolute path to the `SKILL.md` file.
    pub skill_md_path: PathBuf,
    /// Whether the user may invoke this skill as a slash command.
    pub user_invocable: bool,
    /// When true the skill is hidden from the model's skill listing but
    /// still available as a slash command.
    pub disable_model_invocation: bool,
}

#[derive(Debug, Deserialize)]
struct RawFrontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "user-invocable")]
    user_invocable: Option<bool>,
    #[serde(default, rename = "disable-model-invocation")]
    disable_model_invocation: Option<bool>,
}

/// Parsed front-matter fields of one SKILL.md.
pub struct ParsedSkill {
    pub name: Option<String>,
    pub description: String,
    pub user_invocable: bool,
    pub disable_model_invocation: bool,
}

/// Parse a raw SKILL.md string into its front-matter fields.
///
/// Returns `None` when the front-matter is missing, malformed, or lacks a
/// non-empty `description`.
#[must_use]
pub fn parse_skill_file(raw: &str) -> Option<ParsedSkill> {
    let rest = raw.trim_start_matches('\n');
    let after_open = rest.strip_prefix("---")?;
    let close = after_open.find("\n---")?;
    let yaml_block = &after_open[..close];

    let fm: RawFrontmatter = serde_yaml::from_str(yaml_block).ok()?;
    let description = fm.description.filter(|d| !d.trim().is_empty())?;

    Some(ParsedSkill {
        name: fm.name.filter(|n| !n.trim().is_empty()),
        description,
        user_invocable: fm.user_invocable.unwrap_or(true),
        disable_model_invocation: fm.disable_model_invocation.unwrap_or(false),
    })
}

/// Try to load and validate one skill directory.
///
/// Returns `None` and emits a warning when the file is oversized,
/// unreadable, or has invalid front-matter.
fn try_load_skill(skill_dir: &Path, skill_md: &Path, source: &str) -> Option<SkillInfo> {
    let size = skill_md.metadata().map(|m| m.len()).unwrap_or(0);
    if size > MAX_SKILL_FILE_BYTES {
        warn!(
            source,
            path = %skill_md.display(),
            size,
            max = MAX_SKILL_FILE_BYTES,
            "skipping oversized SKILL.md"
        );
        return None;
    }

    let raw = match std::fs::read_to_string(skill_md) {
        Ok(s) => s,
        Err(e) => {
            warn!(source, path = %skill_md.display(), error = %e, "failed to read SKILL.md");
            return None;
        }
    };

    let parsed = match parse_skill_file(&raw) {
        Some(p) => p,
        None => {
            warn!(source, path = %skill_md.display(), "SKILL.md has no usable description — skipping");
            return None;
        }
    };

    let name = parsed.name.unwrap_or_else(|| {
        skill_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "skill".into())
    });

    Some(SkillInfo {
        name,
        description: parsed.description,
        command: String::new(), // assigned after the full set is known
        skill_md_path: skill_md.to_path_buf(),
        user_invocable: parsed.user_invocable,
        disable_model_invocation: parsed.disable_model_invocation,
    })
}

/// Scan one skills root; each immediate subdirectory with a SKILL.md is one
/// skill.
fn scan_skills_dir(dir: &Path, source: &str) -> Vec<SkillInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.path());

    let mut skills = Vec::new();
    for entry in entries {
        let child = entry.path();
        if !child.is_dir() {
            continue;
        }
        let skill_md = child.join("SKILL.md");
        if skill_md.is_file() {
            if let Some(skill) = try_load_skill(&child, &skill_md, source) {
                skills.push(skill);
            }
        }
    }
    skills
}

/// Discover skills from `roots`, lowest-precedence first.  A later root's
/// skill replaces an earlier one with the same name.  Command aliases are
/// assigned afterwards and deduplicated with `_2`, `_3`, … suffixes.
#[must_use]
pub fn discover_skills(roots: &[PathBuf]) -> Vec<SkillInfo> {
    // Keyed by name; later insertions (higher-precedence roots) win.
    let mut by_name: HashMap<String, SkillInfo> = HashMap::new();
    for root in roots {
        for skill in scan_skills_dir(root, &root.to_string_lossy()) {
            by_name.insert(skill.name.clone(), skill);
        }
    }

    let mut skills: Vec<SkillInfo> = by_name.into_values().collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    assign_commands(&mut skills);
    skills
}

/// Assign unique slash-command aliases to a sorted skill list.
pub(crate) fn assign_commands(skills: &mut [SkillInfo]) {
    let mut taken: HashMap<String, usize> = HashMap::new();
    for skill in skills.iter_mut() {
        let base = sanitize_command_name(&skill.name);
        let n = taken.entry(base.clone()).or_insert(0);
        *n += 1;
        skill.command = if *n == 1 {
            base
        } else {
            format!("{base}_{n}")
        };
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
