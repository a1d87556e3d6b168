// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash-command routing over the discovered skill set.
//!
//! An input starting with `/` is parsed as `/<name>[ <args>]`.  Two dispatch
//! styles exist:
//!
//! - `/skill <name> <args>` — fuzzy lookup: exact match on the command
//!   alias, the skill name, or the sanitized variant of the given name.
//! - `/<name> <args>` — strict match on the command alias only.
//!
//! On a match the user message is rewritten (before persistence) into a
//! directive naming the skill; the model then loads the skill file itself
//! through its `read` tool.

use crate::loader::SkillInfo;

/// Sanitize a skill name into a slash-command alias: lowercase,
/// non-alphanumerics to `_`, runs collapsed, edges stripped, truncated to
/// 32 chars, `"skill"` when nothing survives.
pub fn sanitize_command_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = true; // strips leading separators
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out.truncate(32);
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        "skill".into()
    } else {
        out
    }
}

/// Outcome of routing one user input through the command layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRoute {
    /// Not a slash command; persist the input untouched.
    Plain,
    /// A slash command matched a skill; persist the rewritten message.
    Skill {
        skill_name: String,
        rewritten: String,
    },
    /// Looked like a command but matched nothing; persist untouched.
    NoMatch,
}

/// A routable set of skills.
#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    skills: Vec<SkillInfo>,
}

impl SkillSet {
    pub fn new(skills: Vec<SkillInfo>) -> Self {
        Self { skills }
    }

    pub fn skills(&self) -> &[SkillInfo] {
        &self.skills
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Skills the model may invoke on its own (for the system prompt block).
    pub fn model_visible(&self) -> impl Iterator<Item = &SkillInfo> {
        self.skills.iter().filter(|s| !s.disable_model_invocation)
    }

    fn user_invocable(&self) -> impl Iterator<Item = &SkillInfo> {
        self.skills.iter().filter(|s| s.user_invocable)
    }

    /// Strict lookup on the command alias.
    fn by_command(&self, command: &str) -> Option<&SkillInfo> {
        self.user_invocable().find(|s| s.command == command)
    }

    /// Fuzzy lookup: command alias, exact name, or sanitized variant.
    fn fuzzy(&self, name: &str) -> Option<&SkillInfo> {
        let sanitized = sanitize_command_name(name);
        self.user_invocable()
            .find(|s| s.command == name)
            .or_else(|| self.user_invocable().find(|s| s.name == name))
            .or_else(|| self.user_invocable().find(|s| s.command == sanitized))
    }

    /// Route one raw user input.
    pub fn route(&self, input: &str) -> CommandRoute {
        let Some(rest) = input.strip_prefix('/') else {
            return CommandRoute::Plain;
        };
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (rest, ""),
        };
        if head.is_empty() {
            return CommandRoute::Plain;
        }

        let matched = if head == "skill" {
            let (name, args2) = match args.split_once(char::is_whitespace) {
                Some((n, a)) => (n, a.trim()),
                None => (args, ""),
            };
            if name.is_empty() {
                return CommandRoute::NoMatch;
            }
            self.fuzzy(name).map(|s| (s, args2))
        } else {
            self.by_command(head).map(|s| (s, args))
        };

        match matched {
            Some((skill, args)) => CommandRoute::Skill {
                skill_name: skill.name.clone(),
                rewritten: rewrite(&skill.name, args),
            },
            None => CommandRoute::NoMatch,
        }
    }
}

/// The directive the user message is rewritten into on a command match.
fn rewrite(skill_name: &str, args: &str) -> String {
    format!("Use the \"{skill_name}\" skill for this request.\n\nUser input:\n{args}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
