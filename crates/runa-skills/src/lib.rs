// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod command;
mod loader;

pub use command::{sanitize_command_name, CommandRoute, SkillSet};
pub use loader::{discover_skills, parse_skill_file, ParsedSkill, SkillInfo};
