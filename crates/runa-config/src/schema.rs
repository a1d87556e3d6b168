// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

/// Refuse to run below this context-token budget.
pub const MIN_CONTEXT_TOKENS: usize = 1_000;
/// Warn (but run) below this context-token budget.
pub const WARN_CONTEXT_TOKENS: usize = 8_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    /// Optional tool allow/deny policy applied on top of the sandbox policy.
    /// Deny overrides allow; an empty allow list permits every non-denied tool.
    #[serde(default)]
    pub tool_policy: Option<ToolPatternConfig>,
}

fn default_agent_id() -> String {
    "main".into()
}
fn default_max_turns() -> u32 {
    20
}
fn default_context_tokens() -> usize {
    200_000
}
fn default_max_concurrent_runs() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier used as the middle segment of every session key
    /// (`agent:<agent_id>:<tail>`).
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Sampling temperature forwarded to the provider.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Maximum number of inner-loop turns per run before stopping.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Context window budget in tokens.  All char-based pruning math derives
    /// from this via the 4-chars-per-token estimate.
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
    /// Global cap on concurrently executing runs across all sessions.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Directory holding per-session transcript files.  Defaults to
    /// `<data_dir>/runa/sessions` when unset.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Workspace root; bootstrap context files are read from here.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Directory holding memory files (only read when memory is enabled).
    #[serde(default)]
    pub memory_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            system_prompt: None,
            temperature: None,
            max_turns: default_max_turns(),
            context_tokens: default_context_tokens(),
            max_concurrent_runs: default_max_concurrent_runs(),
            session_dir: None,
            workspace_dir: None,
            memory_dir: None,
        }
    }
}

/// Outcome of validating the configured context budget before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextBudgetCheck {
    Ok,
    /// Below the warn threshold but above the hard minimum.
    Low,
    /// Below the hard minimum; the run must be refused.
    TooSmall,
}

impl AgentConfig {
    /// Validate the context-token budget against the warn / refuse thresholds.
    pub fn check_context_budget(&self) -> ContextBudgetCheck {
        if self.context_tokens < MIN_CONTEXT_TOKENS {
            ContextBudgetCheck::TooSmall
        } else if self.context_tokens < WARN_CONTEXT_TOKENS {
            ContextBudgetCheck::Low
        } else {
            ContextBudgetCheck::Ok
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier ("anthropic" | "openai" | "mock" | …).  The
    /// runtime never interprets this beyond passing it to the provider
    /// factory supplied by the embedding application.
    pub provider: String,
    /// Model name forwarded to the provider API.
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: None,
            api_key_env: None,
            api_key: None,
        }
    }
}

fn default_soft_trim_ratio() -> f32 {
    0.3
}
fn default_hard_clear_ratio() -> f32 {
    0.5
}
fn default_max_history_share() -> f32 {
    0.5
}
fn default_soft_trim_max_chars() -> usize {
    4_000
}
fn default_soft_trim_keep_chars() -> usize {
    1_500
}
fn default_min_prunable_tool_chars() -> usize {
    50_000
}
fn default_keep_last_assistants() -> usize {
    3
}

/// Tuning for the three-layer context pruner.
///
/// All ratios are fractions of the char window (context tokens × 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Layer 1 fires when total chars exceed this fraction of the window.
    #[serde(default = "default_soft_trim_ratio")]
    pub soft_trim_ratio: f32,
    /// Layer 2 fires when total chars still exceed this fraction.
    #[serde(default = "default_hard_clear_ratio")]
    pub hard_clear_ratio: f32,
    /// Layer 3 budget as a fraction of the window.
    #[serde(default = "default_max_history_share")]
    pub max_history_share: f32,
    /// Tool results larger than this are soft-trimmed in layer 1.
    #[serde(default = "default_soft_trim_max_chars")]
    pub soft_trim_max_chars: usize,
    /// Head and tail chars preserved when soft-trimming a tool result.
    #[serde(default = "default_soft_trim_keep_chars")]
    pub soft_trim_keep_chars: usize,
    /// Layer 2 only fires when at least this many prunable tool-result chars
    /// remain; below it, clearing placeholders would not buy enough room to
    /// justify destroying content.
    #[serde(default = "default_min_prunable_tool_chars")]
    pub min_prunable_tool_chars: usize,
    /// Layer 3 protects this many trailing assistant messages (and everything
    /// after them) from being dropped.
    #[serde(default = "default_keep_last_assistants")]
    pub keep_last_assistants: usize,
    /// Tool-name patterns whose results may be trimmed or cleared.  Deny
    /// overrides allow; an empty allow list makes every non-denied tool
    /// prunable.
    #[serde(default)]
    pub prunable_tools: ToolPatternConfig,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            soft_trim_ratio: default_soft_trim_ratio(),
            hard_clear_ratio: default_hard_clear_ratio(),
            max_history_share: default_max_history_share(),
            soft_trim_max_chars: default_soft_trim_max_chars(),
            soft_trim_keep_chars: default_soft_trim_keep_chars(),
            min_prunable_tool_chars: default_min_prunable_tool_chars(),
            keep_last_assistants: default_keep_last_assistants(),
            prunable_tools: ToolPatternConfig::default(),
        }
    }
}

/// Glob allow/deny pattern pair over tool names.
///
/// Only `*` (any run of chars) and `?` (one char) are supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPatternConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

fn default_reserve_tokens() -> usize {
    20_000
}
fn default_chunk_ratio() -> f32 {
    0.4
}
fn default_min_chunk_ratio() -> f32 {
    0.15
}
fn default_chunk_parts() -> usize {
    2
}
fn default_summary_max_tokens() -> u32 {
    2_048
}

/// Tuning for the adaptive chunked summarization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Compaction triggers when the token estimate exceeds
    /// `context_tokens - reserve_tokens`.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    /// Baseline chunk budget as a fraction of the context window.
    #[serde(default = "default_chunk_ratio")]
    pub chunk_ratio: f32,
    /// Floor for the chunk budget when oversized messages force the ratio down.
    #[serde(default = "default_min_chunk_ratio")]
    pub min_chunk_ratio: f32,
    /// Number of token-balanced parts when the drop set exceeds the chunk
    /// budget.
    #[serde(default = "default_chunk_parts")]
    pub chunk_parts: usize,
    /// Max tokens requested from the summarizer.
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            reserve_tokens: default_reserve_tokens(),
            chunk_ratio: default_chunk_ratio(),
            min_chunk_ratio: default_min_chunk_ratio(),
            chunk_parts: default_chunk_parts(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    300
}
fn default_retry_cap_ms() -> u64 {
    30_000
}
fn default_retry_jitter() -> f32 {
    0.10
}

/// Exponential-backoff tuning for the provider call.  Only rate-limit
/// classified errors are retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay (±).
    #[serde(default = "default_retry_jitter")]
    pub jitter: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_cap_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    30 * 60
}
fn default_coalesce_ms() -> u64 {
    250
}
fn default_duplicate_window_secs() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between scheduled wakes.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    /// Window within which multiple wake requests coalesce into one run.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
    /// A heartbeat message identical to the last one sent within this window
    /// is suppressed.
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    /// Optional active-hours window.  `start > end` wraps past midnight.
    #[serde(default)]
    pub active_hours: Option<ActiveHoursConfig>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            coalesce_ms: default_coalesce_ms(),
            duplicate_window_secs: default_duplicate_window_secs(),
            active_hours: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActiveHoursConfig {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    /// When false (with the sandbox enabled), exec-style tools are denied.
    #[serde(default = "default_true")]
    pub allow_exec: bool,
    /// When false (with the sandbox enabled), write/edit tools are denied.
    #[serde(default = "default_true")]
    pub allow_write: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_exec: true,
            allow_write: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub enable_memory: bool,
    #[serde(default = "default_true")]
    pub enable_context: bool,
    #[serde(default = "default_true")]
    pub enable_skills: bool,
    #[serde(default)]
    pub enable_heartbeat: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_memory: true,
            enable_context: true,
            enable_skills: true,
            enable_heartbeat: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
