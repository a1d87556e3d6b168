// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    ActiveHoursConfig, AgentConfig, CompactionConfig, Config, ContextBudgetCheck, FeatureFlags,
    HeartbeatConfig, ModelConfig, PruneConfig, RetryConfig, SandboxConfig, ToolPatternConfig,
    MIN_CONTEXT_TOKENS, WARN_CONTEXT_TOKENS,
};
