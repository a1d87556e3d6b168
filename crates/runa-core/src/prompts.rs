// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System prompt assembly.
//!
//! The prompt is rebuilt fresh for every run from, in order: the base
//! prompt, the Project Context block (bootstrap files), the Skills block,
//! memory usage guidance, and the sandbox note.

use runa_config::SandboxConfig;
use runa_skills::SkillSet;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a capable, careful assistant running inside an agent runtime. You can \
call tools to act on the user's behalf. Prefer acting over asking when the \
request is unambiguous; report what you did plainly. When a task is done, \
answer with the result, not a narration of your process.";

const MEMORY_GUIDANCE: &str = "\
## Memory

You have a persistent memory directory. Read relevant memory files before \
answering questions about prior work, and record durable facts (decisions, \
preferences, open threads) by writing files there.";

/// Inputs for one prompt assembly.
#[derive(Debug, Default)]
pub struct PromptInputs<'a> {
    /// Base prompt override; the built-in default when `None`.
    pub base: Option<&'a str>,
    /// Rendered Project Context block (bootstrap file contents).
    pub project_context: Option<&'a str>,
    /// Skills available to the model.
    pub skills: Option<&'a SkillSet>,
    /// Whether memory guidance is included.
    pub memory_enabled: bool,
    /// Sandbox settings; a note is added while the sandbox is active.
    pub sandbox: Option<&'a SandboxConfig>,
}

/// Assemble the system prompt.
pub fn system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::new();
    out.push_str(inputs.base.unwrap_or(DEFAULT_SYSTEM_PROMPT));

    if let Some(ctx) = inputs.project_context {
        if !ctx.trim().is_empty() {
            out.push_str("\n\n## Project Context\n\n");
            out.push_str(ctx.trim_end());
        }
    }

    if let Some(skills) = inputs.skills {
        if let Some(block) = skills_block(skills) {
            out.push_str("\n\n");
            out.push_str(&block);
        }
    }

    if inputs.memory_enabled {
        out.push_str("\n\n");
        out.push_str(MEMORY_GUIDANCE);
    }

    if let Some(note) = inputs.sandbox.and_then(sandbox_note) {
        out.push_str("\n\n");
        out.push_str(&note);
    }

    out
}

/// XML listing of the model-invocable skills.  The model loads a skill's
/// file with its `read` tool when it decides to use one.
pub fn skills_block(skills: &SkillSet) -> Option<String> {
    let mut entries = String::new();
    for skill in skills.model_visible() {
        entries.push_str(&format!(
            "<skill>\n<name>{}</name>\n<description>{}</description>\n<location>{}</location>\n</skill>\n",
            skill.name,
            skill.description.trim(),
            skill.skill_md_path.display(),
        ));
    }
    if entries.is_empty() {
        return None;
    }
    Some(format!(
        "## Skills\n\nThe following skills are available. To use one, read its file at the given location.\n\n{entries}"
    ))
}

fn sandbox_note(sandbox: &SandboxConfig) -> Option<String> {
    if !sandbox.enabled {
        return None;
    }
    let mut restrictions = Vec::new();
    if !sandbox.allow_exec {
        restrictions.push("command execution is disabled");
    }
    if !sandbox.allow_write {
        restrictions.push("file writes are disabled");
    }
    let detail = if restrictions.is_empty() {
        String::new()
    } else {
        format!(" ({})", restrictions.join("; "))
    };
    Some(format!(
        "## Sandbox\n\nYou are running in a sandboxed workspace{detail}. Do not attempt to reach outside it."
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_skills::SkillInfo;
    use std::path::PathBuf;

    fn skill(name: &str, disabled: bool) -> SkillInfo {
        SkillInfo {
            name: name.into(),
            description: format!("{name} description"),
            command: name.into(),
            skill_md_path: PathBuf::from("/skills").join(name).join("SKILL.md"),
            user_invocable: true,
            disable_model_invocation: disabled,
        }
    }

    #[test]
    fn default_prompt_when_no_inputs() {
        let out = system_prompt(&PromptInputs::default());
        assert_eq!(out, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn base_override_replaces_default() {
        let out = system_prompt(&PromptInputs {
            base: Some("You are a test harness."),
            ..Default::default()
        });
        assert!(out.starts_with("You are a test harness."));
        assert!(!out.contains(DEFAULT_SYSTEM_PROMPT));
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let skills = SkillSet::new(vec![skill("deploy", false)]);
        let sandbox = SandboxConfig {
            enabled: true,
            allow_exec: false,
            allow_write: true,
        };
        let out = system_prompt(&PromptInputs {
            base: None,
            project_context: Some("AGENTS.md says hello"),
            skills: Some(&skills),
            memory_enabled: true,
            sandbox: Some(&sandbox),
        });

        let ctx = out.find("## Project Context").unwrap();
        let sk = out.find("## Skills").unwrap();
        let mem = out.find("## Memory").unwrap();
        let sb = out.find("## Sandbox").unwrap();
        assert!(ctx < sk && sk < mem && mem < sb, "section order wrong:\n{out}");
    }

    #[test]
    fn empty_project_context_is_omitted() {
        let out = system_prompt(&PromptInputs {
            project_context: Some("   \n"),
            ..Default::default()
        });
        assert!(!out.contains("## Project Context"));
    }

    #[test]
    fn skills_block_lists_name_description_location() {
        let skills = SkillSet::new(vec![skill("deploy", false)]);
        let block = skills_block(&skills).unwrap();
        assert!(block.contains("<name>deploy</name>"));
        assert!(block.contains("<description>deploy description</description>"));
        assert!(block.contains("<location>/skills/deploy/SKILL.md</location>"));
    }

    #[test]
    fn skills_block_hides_model_disabled_skills() {
        let skills = SkillSet::new(vec![skill("loud", false), skill("quiet", true)]);
        let block = skills_block(&skills).unwrap();
        assert!(block.contains("loud"));
        assert!(!block.contains("quiet"));
    }

    #[test]
    fn skills_block_none_when_all_hidden() {
        let skills = SkillSet::new(vec![skill("quiet", true)]);
        assert!(skills_block(&skills).is_none());
    }

    #[test]
    fn sandbox_note_only_when_enabled() {
        assert!(sandbox_note(&SandboxConfig::default()).is_none());
        let note = sandbox_note(&SandboxConfig {
            enabled: true,
            allow_exec: false,
            allow_write: false,
        })
        .unwrap();
        assert!(note.contains("command execution is disabled"));
        assert!(note.contains("file writes are disabled"));
    }
}
