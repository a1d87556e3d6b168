// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adaptive chunked summarization ("compaction").
//!
//! When pruning alone cannot keep the transcript inside the reserve, the
//! messages in front of the protected tail are summarized into one synthetic
//! user message.  Oversized drop sets are split into token-balanced parts,
//! summarized independently, and merged.  The pass never fails: summarizer
//! errors degrade to a filtered retry and finally to a fixed notice.

use runa_config::CompactionConfig;
use runa_model::{estimate_tokens, ContentBlock, Message, ModelProvider, Role};
use tracing::warn;

use crate::prune::protected_suffix_index;

// ─── Summarizer prompts ───────────────────────────────────────────────────────

pub(crate) const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a context summarization assistant. You produce dense, factual \
     summaries of an agent conversation so the conversation can continue in a \
     limited context window. Preserve file paths, decisions, error messages, \
     and user preferences verbatim where they matter.";

const SECTION_INSTRUCTION: &str = "\
Summarize the conversation below using EXACTLY these Markdown sections:

## Goals
## Constraints & Preferences
## Progress
### Completed
### In Progress
### Blocked
## Key Decisions
## Next Steps
## Key Information";

const UPDATE_INSTRUCTION: &str = "\
A summary of the earlier conversation already exists. Update it with the new \
events below: preserve and extend the existing sections, never discard \
information that is still relevant.";

const MERGE_INSTRUCTION: &str = "\
Merge the following partial summaries of one conversation into a single \
summary with the same sections. Keep every fact that is still relevant; \
remove only duplication.";

// ─── Public types ─────────────────────────────────────────────────────────────

/// Result of one compaction pass.
#[derive(Debug, Clone)]
pub struct Compaction {
    /// The final summary text (sections plus the file-ops appendix).
    pub summary: String,
    /// The synthetic user-role message carrying the summary.
    pub summary_message: Message,
    /// The protected tail that remains as live history.
    pub kept: Vec<Message>,
    pub dropped_messages: usize,
    pub tokens_before: usize,
    /// Index (into the input list) of the first kept message, when anything
    /// was dropped.
    pub first_kept: Option<usize>,
}

/// True when the transcript no longer fits the reserve and must be
/// summarized before the next model call.
pub fn needs_compaction(
    messages: &[Message],
    context_tokens: usize,
    cfg: &CompactionConfig,
) -> bool {
    estimate_tokens(messages) > context_tokens.saturating_sub(cfg.reserve_tokens)
}

/// Summarize everything in front of the protected tail.
///
/// `previous_summary` (from an earlier compaction) is folded in via the
/// update prompt variant so established context survives repeated passes.
pub async fn prepare_compaction(
    messages: &[Message],
    previous_summary: Option<&str>,
    provider: &dyn ModelProvider,
    context_tokens: usize,
    keep_last_assistants: usize,
    cfg: &CompactionConfig,
) -> Compaction {
    let tokens_before = estimate_tokens(messages);
    let split = protected_suffix_index(messages, keep_last_assistants);
    let dropped = &messages[..split];
    let kept: Vec<Message> = messages[split..].to_vec();

    if dropped.is_empty() {
        let summary = previous_summary.unwrap_or_default().to_string();
        return Compaction {
            summary_message: Message::user(summary.clone()),
            summary,
            kept,
            dropped_messages: 0,
            tokens_before,
            first_kept: None,
        };
    }

    let mut summary = summarize_dropped(dropped, previous_summary, provider, context_tokens, cfg)
        .await
        .unwrap_or_else(|| {
            format!(
                "Context contained {} messages. Summary unavailable due to size limits.",
                dropped.len()
            )
        });

    if let Some(appendix) = file_ops_appendix(dropped) {
        summary.push_str("\n\n");
        summary.push_str(&appendix);
    }

    Compaction {
        summary_message: Message::user(summary.clone()),
        summary,
        kept,
        dropped_messages: dropped.len(),
        tokens_before,
        first_kept: (split < messages.len()).then_some(split),
    }
}

// ─── Summarization ────────────────────────────────────────────────────────────

/// Chunk budget in tokens, scaled down when the average message is large
/// relative to the window.
fn chunk_budget_tokens(dropped: &[Message], context_tokens: usize, cfg: &CompactionConfig) -> usize {
    let window = context_tokens as f32;
    let avg = estimate_tokens(dropped) as f32 / dropped.len().max(1) as f32;
    let padded = avg * 1.2;
    let mut ratio = cfg.chunk_ratio;
    if padded > window * 0.1 {
        ratio = (cfg.chunk_ratio * (window * 0.1) / padded).clamp(cfg.min_chunk_ratio, cfg.chunk_ratio);
    }
    (window * ratio) as usize
}

/// Split into up to `parts` token-balanced contiguous chunks.
fn split_balanced(dropped: &[Message], parts: usize) -> Vec<&[Message]> {
    let parts = parts.max(1).min(dropped.len());
    let total = estimate_tokens(dropped);
    let target = total / parts + 1;
    let mut out = Vec::with_capacity(parts);
    let mut start = 0usize;
    let mut acc = 0usize;
    for (i, m) in dropped.iter().enumerate() {
        acc += m.approx_tokens();
        if acc >= target && out.len() + 1 < parts {
            out.push(&dropped[start..=i]);
            start = i + 1;
            acc = 0;
        }
    }
    if start < dropped.len() {
        out.push(&dropped[start..]);
    }
    out
}

async fn summarize_dropped(
    dropped: &[Message],
    previous_summary: Option<&str>,
    provider: &dyn ModelProvider,
    context_tokens: usize,
    cfg: &CompactionConfig,
) -> Option<String> {
    let budget = chunk_budget_tokens(dropped, context_tokens, cfg);
    let attempt = if estimate_tokens(dropped) > budget && dropped.len() > 1 {
        summarize_in_parts(dropped, previous_summary, provider, cfg).await
    } else {
        summarize_whole(dropped, previous_summary, provider, cfg, None).await
    };

    match attempt {
        Ok(summary) => Some(summary),
        Err(e) => {
            warn!(error = %e, "summarizer failed; retrying with oversized messages filtered");
            match summarize_whole(
                dropped,
                previous_summary,
                provider,
                cfg,
                Some(context_tokens),
            )
            .await
            {
                Ok(summary) => Some(summary),
                Err(e2) => {
                    warn!(error = %e2, "filtered summarizer retry failed");
                    None
                }
            }
        }
    }
}

async fn summarize_whole(
    dropped: &[Message],
    previous_summary: Option<&str>,
    provider: &dyn ModelProvider,
    cfg: &CompactionConfig,
    filter_above_half_of: Option<usize>,
) -> anyhow::Result<String> {
    let history = match filter_above_half_of {
        // Messages larger than half the window cannot fit a summarization
        // prompt; replace them with a size note.
        Some(context_tokens) => serialize_history_filtered(dropped, context_tokens),
        None => serialize_history(dropped),
    };
    let prompt = match previous_summary {
        Some(prev) if !prev.is_empty() => format!(
            "{UPDATE_INSTRUCTION}\n\n{SECTION_INSTRUCTION}\n\nExisting summary:\n{prev}\n\nNew events:\n{history}"
        ),
        _ => format!("{SECTION_INSTRUCTION}\n\nConversation:\n{history}"),
    };
    provider
        .complete_simple(SUMMARY_SYSTEM_PROMPT, &prompt, cfg.summary_max_tokens)
        .await
}

async fn summarize_in_parts(
    dropped: &[Message],
    previous_summary: Option<&str>,
    provider: &dyn ModelProvider,
    cfg: &CompactionConfig,
) -> anyhow::Result<String> {
    let mut partials = Vec::new();
    for part in split_balanced(dropped, cfg.chunk_parts) {
        let history = serialize_history(part);
        let prompt = format!("{SECTION_INSTRUCTION}\n\nConversation:\n{history}");
        let partial = provider
            .complete_simple(SUMMARY_SYSTEM_PROMPT, &prompt, cfg.summary_max_tokens)
            .await?;
        partials.push(partial);
    }

    let mut merge_input = String::new();
    if let Some(prev) = previous_summary {
        if !prev.is_empty() {
            merge_input.push_str(&format!("Partial summary (earlier context):\n{prev}\n\n"));
        }
    }
    for (i, p) in partials.iter().enumerate() {
        merge_input.push_str(&format!("Partial summary {}:\n{p}\n\n", i + 1));
    }
    provider
        .complete_simple(
            SUMMARY_SYSTEM_PROMPT,
            &format!("{MERGE_INSTRUCTION}\n\n{merge_input}"),
            cfg.summary_max_tokens,
        )
        .await
}

// ─── History serialization ────────────────────────────────────────────────────

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

fn serialize_message(m: &Message) -> String {
    let mut parts = Vec::new();
    match m.blocks() {
        [] => parts.push(m.text()),
        blocks => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.clone()),
                    ContentBlock::ToolUse { name, input, .. } => {
                        parts.push(format!("[tool_use: {name}({input})]"));
                    }
                    ContentBlock::ToolResult { name, content, .. } => {
                        parts.push(format!("[tool_result {name}: {content}]"));
                    }
                }
            }
        }
    }
    format!("{}: {}", role_label(m.role), parts.join(" "))
}

/// Serialize a message list into plain text for a summarization prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(serialize_message)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Like [`serialize_history`] but messages whose own token estimate exceeds
/// half the context window are replaced with a size note.
fn serialize_history_filtered(messages: &[Message], context_tokens: usize) -> String {
    let limit_tokens = (context_tokens / 2).max(1);
    messages
        .iter()
        .map(|m| {
            let tokens = m.approx_tokens();
            if tokens > limit_tokens {
                format!(
                    "[Large {} message (~{} K tokens) omitted]",
                    role_label(m.role).to_lowercase(),
                    tokens / 1_000,
                )
            } else {
                serialize_message(m)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── File-ops appendix ────────────────────────────────────────────────────────

/// Collect `path` arguments from file tools in the dropped messages so the
/// model can keep reasoning about files that fell out of history.
fn file_ops_appendix(dropped: &[Message]) -> Option<String> {
    let mut read_files: Vec<String> = Vec::new();
    let mut modified_files: Vec<String> = Vec::new();

    for msg in dropped.iter().filter(|m| m.role == Role::Assistant) {
        for block in msg.blocks() {
            let ContentBlock::ToolUse { name, input, .. } = block else {
                continue;
            };
            let Some(path) = input.get("path").and_then(|p| p.as_str()) else {
                continue;
            };
            match name.as_str() {
                "write" | "edit" => modified_files.push(path.to_string()),
                "read" => read_files.push(path.to_string()),
                _ => {}
            }
        }
    }

    modified_files.sort();
    modified_files.dedup();
    read_files.sort();
    read_files.dedup();
    read_files.retain(|p| !modified_files.contains(p));

    if modified_files.is_empty() && read_files.is_empty() {
        return None;
    }

    let mut out = String::new();
    if !modified_files.is_empty() {
        out.push_str("<modified-files>\n");
        out.push_str(&modified_files.join("\n"));
        out.push_str("\n</modified-files>");
    }
    if !read_files.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("<read-files>\n");
        out.push_str(&read_files.join("\n"));
        out.push_str("\n</read-files>");
    }
    Some(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
