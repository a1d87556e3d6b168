// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use runa_model::Message;

/// Events emitted by the agent loop during a run.
/// Consumers (CLI, embedding applications, subagent observers) subscribe to
/// these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A run began
    AgentStart { run_id: String },
    /// The run finished; terminal
    AgentEnd,
    /// The run failed; terminal
    AgentError { error: String },
    /// An inner-loop turn began
    TurnStart { turn: u32 },
    /// The turn's model call and tool executions finished
    TurnEnd { turn: u32 },
    /// First text delta of an assistant message is about to arrive
    MessageStart,
    /// A streamed text chunk
    MessageDelta { delta: String },
    /// The assistant message was persisted; `text` is its joined text
    MessageEnd { message: Message, text: String },
    /// A tool call is about to execute
    ToolExecutionStart {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// A tool call finished (successfully or with an error result)
    ToolExecutionEnd {
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    /// A tool call was skipped because steering input arrived
    ToolSkipped { id: String, name: String },
    /// Queued steering input was picked up
    Steering { pending_count: usize },
    /// A compaction pass replaced part of the history with a summary
    Compaction {
        summary_chars: usize,
        dropped_messages: usize,
    },
    /// The provider reported a context overflow; a one-shot compaction
    /// retry is in flight
    ContextOverflowCompact { error: String },
    /// The provider call is being retried after a rate limit
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// A spawned subagent finished and its summary was delivered
    SubagentSummary {
        session_key: String,
        label: Option<String>,
        summary: String,
    },
    /// A spawned subagent failed
    SubagentError {
        session_key: String,
        label: Option<String>,
        error: String,
    },
}

impl AgentEvent {
    /// True for the events that terminate a run's stream.
    pub fn is_final(&self) -> bool {
        matches!(self, AgentEvent::AgentEnd | AgentEvent::AgentError { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
