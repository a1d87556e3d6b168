// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Three-layer progressive context pruning.
//!
//! All comparisons are performed in chars against the char window
//! (`context_tokens × 4`).  Layers apply in order, each only when the
//! previous one did not bring the transcript below its threshold:
//!
//! 1. **Soft trim** — oversized prunable `tool_result` contents are reduced
//!    to a head + tail excerpt.
//! 2. **Hard clear** — prunable `tool_result` contents are replaced with a
//!    short placeholder, oldest first, until the ratio falls below the
//!    threshold.  Block structure and ids survive so the model keeps the
//!    causal chain.
//! 3. **Message drop** — whole messages are dropped oldest-first, protecting
//!    the last N assistant messages and everything after them.
//!
//! The pruner is pure: it never mutates the session log.

use runa_config::PruneConfig;
use runa_model::{ContentBlock, Message, MessageContent, Role, CHARS_PER_TOKEN_ESTIMATE};
use runa_tools::ToolPolicy;

/// Placeholder installed by the hard-clear layer.
pub const CLEARED_PLACEHOLDER: &str = "[Old tool result content cleared]";

/// Result of one prune pass.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    /// Kept messages in input order (possibly with trimmed tool results).
    pub kept: Vec<Message>,
    /// Dropped messages in input order.
    pub dropped: Vec<Message>,
    pub soft_trimmed: usize,
    pub hard_cleared: usize,
    /// The char budget layer 3 enforced.
    pub budget_chars: usize,
}

fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.char_len()).sum()
}

/// Largest prefix of `s` not exceeding `n` bytes, on a char boundary.
fn safe_prefix(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut end = n;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Largest suffix of `s` not exceeding `n` bytes, on a char boundary.
fn safe_suffix(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Reduce one oversized tool result to a head + tail excerpt.
fn soft_trim_content(content: &str, keep: usize) -> String {
    let omitted = content.len().saturating_sub(keep * 2);
    format!(
        "{}\n...\n{}\n[Tool result trimmed: {omitted} chars omitted]",
        safe_prefix(content, keep),
        safe_suffix(content, keep),
    )
}

/// Apply `f` to every prunable tool_result block of `msg`; returns how many
/// blocks changed.
fn rewrite_tool_results(
    msg: &mut Message,
    policy: &ToolPolicy,
    mut eligible: impl FnMut(&str) -> bool,
    f: impl Fn(&str) -> String,
) -> usize {
    let MessageContent::Blocks(blocks) = &mut msg.content else {
        return 0;
    };
    let mut changed = 0;
    for block in blocks {
        if let ContentBlock::ToolResult { name, content, .. } = block {
            if policy.is_allowed(name) && eligible(content) {
                *content = f(content);
                changed += 1;
            }
        }
    }
    changed
}

/// Index of the first protected message: the `keep_last_assistants`-th
/// assistant message from the end.  Everything at or after that index is
/// protected; `messages.len()` when there is no assistant message at all.
pub(crate) fn protected_suffix_index(messages: &[Message], keep_last_assistants: usize) -> usize {
    let mut seen = 0usize;
    let mut idx = messages.len();
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::Assistant {
            seen += 1;
            idx = i;
            if seen >= keep_last_assistants.max(1) {
                break;
            }
        }
    }
    idx
}

/// Fit `messages` into the char budget derived from `context_tokens`.
pub fn prune(messages: &[Message], context_tokens: usize, cfg: &PruneConfig) -> PruneOutcome {
    let char_window = context_tokens * CHARS_PER_TOKEN_ESTIMATE;
    let budget_chars = (char_window as f32 * cfg.max_history_share) as usize;
    let policy = ToolPolicy::from_config(&cfg.prunable_tools);

    let mut msgs: Vec<Message> = messages.to_vec();
    let mut soft_trimmed = 0usize;
    let mut hard_cleared = 0usize;

    // ── Layer 1: soft trim ────────────────────────────────────────────────────
    if char_window > 0
        && total_chars(&msgs) as f32 / char_window as f32 > cfg.soft_trim_ratio
    {
        for msg in &mut msgs {
            soft_trimmed += rewrite_tool_results(
                msg,
                &policy,
                |content| content.len() > cfg.soft_trim_max_chars,
                |content| soft_trim_content(content, cfg.soft_trim_keep_chars),
            );
        }
    }

    // ── Layer 2: hard clear ───────────────────────────────────────────────────
    if char_window > 0 {
        let prunable_chars: usize = msgs
            .iter()
            .flat_map(|m| m.blocks())
            .filter_map(|b| match b {
                ContentBlock::ToolResult { name, content, .. } if policy.is_allowed(name) => {
                    Some(content.len())
                }
                _ => None,
            })
            .sum();

        let mut total = total_chars(&msgs);
        if total as f32 / char_window as f32 > cfg.hard_clear_ratio
            && prunable_chars >= cfg.min_prunable_tool_chars
        {
            for msg in &mut msgs {
                if total as f32 / char_window as f32 <= cfg.hard_clear_ratio {
                    break;
                }
                let before = msg.char_len();
                hard_cleared += rewrite_tool_results(
                    msg,
                    &policy,
                    |content| content != CLEARED_PLACEHOLDER,
                    |_| CLEARED_PLACEHOLDER.to_string(),
                );
                total = total - before + msg.char_len();
            }
        }
    }

    // ── Layer 3: message drop ─────────────────────────────────────────────────
    if total_chars(&msgs) <= budget_chars {
        return PruneOutcome {
            kept: msgs,
            dropped: Vec::new(),
            soft_trimmed,
            hard_cleared,
            budget_chars,
        };
    }

    let protect_from = protected_suffix_index(&msgs, cfg.keep_last_assistants);

    let protected_chars: usize = msgs[protect_from..].iter().map(|m| m.char_len()).sum();

    let keep_flags: Vec<bool> = if protected_chars > budget_chars || protect_from == msgs.len() {
        // The protected suffix alone blows the budget (or there is nothing
        // to protect): strictly backward fill from the end.
        let mut flags = vec![false; msgs.len()];
        let mut used = 0usize;
        for (i, m) in msgs.iter().enumerate().rev() {
            let len = m.char_len();
            if used + len > budget_chars {
                break;
            }
            used += len;
            flags[i] = true;
        }
        flags
    } else {
        // Keep the protected suffix, then fill backward in front of it.
        let mut flags = vec![false; msgs.len()];
        for flag in flags.iter_mut().skip(protect_from) {
            *flag = true;
        }
        let mut used = protected_chars;
        for i in (0..protect_from).rev() {
            let len = msgs[i].char_len();
            if used + len > budget_chars {
                break;
            }
            used += len;
            flags[i] = true;
        }
        flags
    };

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (keep, msg) in keep_flags.into_iter().zip(msgs) {
        if keep {
            kept.push(msg);
        } else {
            dropped.push(msg);
        }
    }

    PruneOutcome {
        kept,
        dropped,
        soft_trimmed,
        hard_cleared,
        budget_chars,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
