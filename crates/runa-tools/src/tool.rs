// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

/// Execution context handed to every tool call.
///
/// `cancel` is the combined run-level ∪ tool-level cancellation signal; the
/// loop flips it to `true` when the run is aborted, and tools are expected to
/// observe it at their next await point and release resources.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Normalized key of the session this call belongs to.
    pub session_key: String,
    /// Becomes `true` when the call must be abandoned.
    pub cancel: watch::Receiver<bool>,
    /// Per-tool wall-clock timeout (e.g. 30 s for exec-style tools).
    /// `None` means the tool imposes its own limit or runs unbounded.
    pub timeout: Option<Duration>,
}

impl ToolContext {
    /// Context with a fresh, never-cancelled signal.  Test and one-off use.
    pub fn detached(session_key: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            session_key: session_key.into(),
            cancel: rx,
            timeout: None,
        }
    }

    /// True when cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Trait that every tool must implement.
///
/// The runtime never inspects `parameters_schema` beyond forwarding it to the
/// model, and never interprets tool output: a tool produces a plain string
/// which becomes the `tool_result` content verbatim.  Failures are returned
/// as `Err` and converted to error-content strings at the registry seam —
/// they are never raised into the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
