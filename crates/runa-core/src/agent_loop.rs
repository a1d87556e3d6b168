// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The dual-level turn loop.
//!
//! `run_loop` returns an event stream synchronously and drives it from a
//! detached task.  The outer loop restarts the inner loop while follow-up
//! input arrives; the inner loop runs one model call plus its tool
//! executions per turn, checking the steering queue at the documented
//! checkpoints and honoring cancellation at every suspension point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::warn;

use runa_config::{CompactionConfig, PruneConfig, RetryConfig};
use runa_model::{
    classify, CompletionRequest, ContentBlock, ErrorKind, Message, ModelProvider, ProviderEvent,
    ToolInvocation, ToolSchema,
};
use runa_session::{SessionKey, ToolResultGuard};
use runa_tools::{ToolContext, ToolOutcome, ToolRegistry};

use crate::compact::{prepare_compaction, Compaction};
use crate::events::AgentEvent;
use crate::prune::prune;
use crate::steer::SteeringQueue;
use crate::stream::{EventSink, EventStream};

/// Result content for tool calls abandoned because steering input arrived.
pub const SKIPPED_RESULT_CONTENT: &str = "Skipped due to queued user message.";

/// Everything one loop invocation needs.  The controller assembles this; the
/// loop itself owns no global state.
pub struct LoopParams {
    pub run_id: String,
    pub key: SessionKey,
    pub guard: Arc<ToolResultGuard>,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    /// Schemas of the tools resolved for this run; calls to anything else
    /// come back as error results.
    pub tool_schemas: Vec<ToolSchema>,
    pub system_prompt: String,
    /// Live history at loop entry (after the user message was appended).
    pub initial_messages: Vec<Message>,
    pub compaction_summary: Option<String>,
    pub temperature: Option<f32>,
    pub max_turns: u32,
    pub context_tokens: usize,
    pub prune_cfg: PruneConfig,
    pub compaction_cfg: CompactionConfig,
    pub retry_cfg: RetryConfig,
    pub cancel: watch::Receiver<bool>,
    pub steering: Arc<SteeringQueue>,
    /// Polled when the inner loop exits; non-empty output restarts it.
    pub follow_ups: Option<Arc<dyn Fn() -> Vec<String> + Send + Sync>>,
    pub tool_timeout: Option<Duration>,
}

/// What a finished (or stopped) loop hands back.
#[derive(Debug, Clone, Default)]
pub struct LoopResult {
    pub text: String,
    pub turns: u32,
    pub tool_calls: u32,
    pub cancelled: bool,
    /// Set when the run failed; the stream was closed with `agent_error`.
    pub error: Option<String>,
}

/// Start the loop.  Returns its event stream immediately; events arrive
/// from a detached task and the stream ends after `agent_end`/`agent_error`.
pub fn run_loop(params: LoopParams) -> EventStream<AgentEvent, LoopResult> {
    let (sink, stream) = EventStream::channel(|e: &AgentEvent| e.is_final());
    tokio::spawn(drive(params, sink));
    stream
}

enum LoopError {
    Cancelled,
    Fatal(anyhow::Error),
}

enum InnerExit {
    /// The inner loop drained naturally; follow-ups may restart it.
    Done,
    /// Turn limit or cancellation; leave the outer loop too.
    Stop,
}

struct LoopState {
    current: Vec<Message>,
    summary: Option<String>,
    turns: u32,
    tool_calls: u32,
    final_text: String,
    cancelled: bool,
    overflow_attempted: bool,
    allowed: HashSet<String>,
}

impl LoopState {
    fn result(&self, error: Option<String>) -> LoopResult {
        LoopResult {
            text: self.final_text.clone(),
            turns: self.turns,
            tool_calls: self.tool_calls,
            cancelled: self.cancelled,
            error,
        }
    }
}

async fn drive(mut p: LoopParams, sink: EventSink<AgentEvent, LoopResult>) {
    sink.push(AgentEvent::AgentStart {
        run_id: p.run_id.clone(),
    });

    let mut state = LoopState {
        current: std::mem::take(&mut p.initial_messages),
        summary: p.compaction_summary.take(),
        turns: 0,
        tool_calls: 0,
        final_text: String::new(),
        cancelled: false,
        overflow_attempted: false,
        allowed: p.tool_schemas.iter().map(|s| s.name.clone()).collect(),
    };

    match run_outer(&p, &mut state, &sink).await {
        Ok(()) => {
            sink.push(AgentEvent::AgentEnd);
            sink.end(state.result(None));
        }
        Err(LoopError::Cancelled) => {
            state.cancelled = true;
            sink.push(AgentEvent::AgentEnd);
            sink.end(state.result(None));
        }
        Err(LoopError::Fatal(e)) => {
            let error = format!("{e:#}");
            sink.push(AgentEvent::AgentError {
                error: error.clone(),
            });
            sink.end(state.result(Some(error)));
        }
    }
}

async fn run_outer(
    p: &LoopParams,
    state: &mut LoopState,
    sink: &EventSink<AgentEvent, LoopResult>,
) -> Result<(), LoopError> {
    // Pick up anything steered in during the caller's setup.
    let mut pending: Vec<String> = p.steering.drain();

    loop {
        match run_inner(p, state, sink, &mut pending).await? {
            InnerExit::Stop => return Ok(()),
            InnerExit::Done => {}
        }
        let follow = p
            .follow_ups
            .as_ref()
            .map(|f| f())
            .unwrap_or_default();
        if follow.is_empty() {
            return Ok(());
        }
        pending = follow;
    }
}

async fn run_inner(
    p: &LoopParams,
    state: &mut LoopState,
    sink: &EventSink<AgentEvent, LoopResult>,
    pending: &mut Vec<String>,
) -> Result<InnerExit, LoopError> {
    let mut has_more_tool_calls = true;

    while has_more_tool_calls || !pending.is_empty() {
        if state.turns >= p.max_turns {
            return Ok(InnerExit::Stop);
        }
        if *p.cancel.borrow() {
            state.cancelled = true;
            return Ok(InnerExit::Stop);
        }

        state.turns += 1;
        sink.push(AgentEvent::TurnStart { turn: state.turns });

        // Steering checkpoint: inner-iteration start.
        pending.extend(p.steering.drain());
        for text in pending.drain(..) {
            let msg = Message::user(text);
            p.guard
                .append(&p.key, &msg)
                .map_err(LoopError::Fatal)?;
            state.current.push(msg);
        }

        // Fit the history into the char budget; the compaction summary (if
        // any) rides in front of the pruned list.
        let pruned = prune(&state.current, p.context_tokens, &p.prune_cfg);
        let mut messages_for_model = pruned.kept;
        if let Some(summary) = &state.summary {
            messages_for_model.insert(0, Message::user(summary.clone()));
        }

        let req = CompletionRequest {
            system: Some(p.system_prompt.clone()),
            messages: messages_for_model,
            tools: p.tool_schemas.clone(),
            temperature: p.temperature,
        };

        let turn = match call_with_retry(p, sink, req).await {
            Ok(turn) => turn,
            Err(LoopError::Cancelled) => {
                state.cancelled = true;
                return Ok(InnerExit::Stop);
            }
            Err(LoopError::Fatal(e)) => {
                if classify(&e) == ErrorKind::ContextOverflow && !state.overflow_attempted {
                    state.overflow_attempted = true;
                    sink.push(AgentEvent::ContextOverflowCompact {
                        error: format!("{e:#}"),
                    });
                    let c = prepare_compaction(
                        &state.current,
                        state.summary.as_deref(),
                        p.provider.as_ref(),
                        p.context_tokens,
                        p.prune_cfg.keep_last_assistants,
                        &p.compaction_cfg,
                    )
                    .await;
                    sink.push(AgentEvent::Compaction {
                        summary_chars: c.summary.len(),
                        dropped_messages: c.dropped_messages,
                    });
                    if c.dropped_messages > 0 {
                        persist_boundary(p, &c);
                        state.current = c.kept.clone();
                    }
                    state.summary = Some(c.summary);
                    // The retried turn is not charged against max_turns.
                    state.turns -= 1;
                    continue;
                }
                return Err(LoopError::Fatal(e));
            }
        };

        if !turn.blocks.is_empty() {
            let msg = Message::assistant_blocks(turn.blocks.clone());
            p.guard
                .append(&p.key, &msg)
                .map_err(LoopError::Fatal)?;
            state.current.push(msg.clone());
            sink.push(AgentEvent::MessageEnd {
                message: msg,
                text: turn.text.clone(),
            });
        }

        if turn.calls.is_empty() {
            if !turn.text.is_empty() {
                state.final_text = turn.text.clone();
            }
            sink.push(AgentEvent::TurnEnd { turn: state.turns });
            pending.extend(p.steering.drain());
            has_more_tool_calls = false;
            continue;
        }
        has_more_tool_calls = true;

        // Execute tool calls serially in emission order.  After each one,
        // the steering checkpoint may interrupt the remainder.
        let mut result_blocks = Vec::with_capacity(turn.calls.len());
        let mut interrupted = false;
        for (i, call) in turn.calls.iter().enumerate() {
            if interrupted {
                sink.push(AgentEvent::ToolSkipped {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                result_blocks.push(ContentBlock::tool_result(
                    &call.id,
                    &call.name,
                    SKIPPED_RESULT_CONTENT,
                ));
                continue;
            }

            sink.push(AgentEvent::ToolExecutionStart {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.arguments.clone(),
            });
            let outcome = execute_tool(p, state, call).await;
            state.tool_calls += 1;
            sink.push(AgentEvent::ToolExecutionEnd {
                id: call.id.clone(),
                name: call.name.clone(),
                result: outcome.content.clone(),
                is_error: outcome.is_error,
            });
            result_blocks.push(ContentBlock::tool_result(
                &call.id,
                &call.name,
                outcome.content,
            ));

            // Steering checkpoint: after each tool execution.
            if !p.steering.is_empty() {
                let queued = p.steering.drain();
                sink.push(AgentEvent::Steering {
                    pending_count: queued.len(),
                });
                pending.extend(queued);
                if i + 1 < turn.calls.len() {
                    interrupted = true;
                }
            }
        }

        let result_msg = Message::tool_results(result_blocks);
        p.guard
            .append(&p.key, &result_msg)
            .map_err(LoopError::Fatal)?;
        state.current.push(result_msg);
        sink.push(AgentEvent::TurnEnd { turn: state.turns });
    }

    Ok(InnerExit::Done)
}

/// A cancellation future that resolves only on an actual cancel signal;
/// a dropped sender parks forever instead of firing spuriously.
async fn wait_cancel(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn execute_tool(p: &LoopParams, state: &LoopState, call: &ToolInvocation) -> ToolOutcome {
    if !state.allowed.contains(&call.name) {
        return ToolOutcome {
            content: format!("unknown tool: {}", call.name),
            is_error: true,
        };
    }
    let ctx = ToolContext {
        session_key: p.key.full(),
        cancel: p.cancel.clone(),
        timeout: p.tool_timeout,
    };
    let mut cancel = p.cancel.clone();
    tokio::select! {
        biased;
        _ = wait_cancel(&mut cancel) => ToolOutcome {
            content: "Tool execution aborted by cancellation.".into(),
            is_error: true,
        },
        outcome = p.tools.execute(&call.name, call.arguments.clone(), &ctx) => outcome,
    }
}

// ─── Provider call with retry ─────────────────────────────────────────────────

struct TurnOutput {
    blocks: Vec<ContentBlock>,
    calls: Vec<ToolInvocation>,
    text: String,
}

async fn call_with_retry(
    p: &LoopParams,
    sink: &EventSink<AgentEvent, LoopResult>,
    req: CompletionRequest,
) -> Result<TurnOutput, LoopError> {
    let attempts = p.retry_cfg.attempts.max(1);
    let mut attempt = 1u32;
    loop {
        if *p.cancel.borrow() {
            return Err(LoopError::Cancelled);
        }
        match stream_once(p, sink, req.clone()).await {
            Ok(out) => return Ok(out),
            Err(LoopError::Cancelled) => return Err(LoopError::Cancelled),
            Err(LoopError::Fatal(e)) => {
                if classify(&e) != ErrorKind::RateLimit || attempt >= attempts {
                    return Err(LoopError::Fatal(e));
                }
                let delay = backoff_delay(attempt, &p.retry_cfg);
                sink.push(AgentEvent::Retry {
                    attempt,
                    delay,
                    error: format!("{e:#}"),
                });
                let mut cancel = p.cancel.clone();
                tokio::select! {
                    biased;
                    _ = wait_cancel(&mut cancel) => return Err(LoopError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff with a cap and ±`jitter` noise.
fn backoff_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let base = cfg.base_delay_ms as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(cfg.max_delay_ms as f64);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let unit = (nanos % 2_001) as f64 / 1_000.0 - 1.0; // [-1, 1]
    let jittered = capped * (1.0 + cfg.jitter as f64 * unit);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// One streaming provider call.  Accumulators are local, so every retry
/// attempt starts clean.
async fn stream_once(
    p: &LoopParams,
    sink: &EventSink<AgentEvent, LoopResult>,
    req: CompletionRequest,
) -> Result<TurnOutput, LoopError> {
    let mut stream = p.provider.stream(req).await.map_err(LoopError::Fatal)?;

    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut calls: Vec<ToolInvocation> = Vec::new();
    let mut text_parts: Vec<String> = Vec::new();
    let mut message_started = false;
    let mut cancel = p.cancel.clone();

    loop {
        let event = tokio::select! {
            biased;
            _ = wait_cancel(&mut cancel) => return Err(LoopError::Cancelled),
            ev = stream.next() => ev,
        };
        let Some(event) = event else { break };
        match event.map_err(LoopError::Fatal)? {
            ProviderEvent::TextDelta { delta } if !delta.is_empty() => {
                if !message_started {
                    message_started = true;
                    sink.push(AgentEvent::MessageStart);
                }
                sink.push(AgentEvent::MessageDelta { delta });
            }
            ProviderEvent::TextDelta { .. } => {}
            ProviderEvent::TextEnd { content } => {
                text_parts.push(content.clone());
                blocks.push(ContentBlock::text(content));
            }
            ProviderEvent::ToolCallStart { .. } => {}
            ProviderEvent::ToolCallEnd { call } => {
                blocks.push(ContentBlock::tool_use(
                    &call.id,
                    &call.name,
                    call.arguments.clone(),
                ));
                calls.push(call);
            }
            ProviderEvent::Done => break,
        }
    }

    Ok(TurnOutput {
        blocks,
        calls,
        text: text_parts.join("\n"),
    })
}

/// Record the compaction boundary in the session log.  Best-effort: a
/// failure here must not kill the recovery path that is freeing context.
fn persist_boundary(p: &LoopParams, c: &Compaction) {
    let Some(first_kept) = c.kept.first() else {
        warn!(session = %p.key, "compaction kept nothing; boundary not persisted");
        return;
    };
    match p.guard.log().resolve_message_entry_id(&p.key, first_kept) {
        Ok(Some(id)) => {
            if let Err(e) = p
                .guard
                .log()
                .append_compaction(&p.key, &c.summary, id, c.tokens_before)
            {
                warn!(session = %p.key, error = %e, "failed to persist compaction boundary");
            }
        }
        Ok(None) => {
            warn!(session = %p.key, "first kept message missing from log; boundary not persisted");
        }
        Err(e) => {
            warn!(session = %p.key, error = %e, "failed to resolve compaction boundary entry");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
