// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-result pairing guard.
//!
//! Every `tool_use` block an assistant message introduces must eventually be
//! answered by a `tool_result` block with the same id in a later user
//! message.  Crashes, aborts, and misbehaving models all break that pairing;
//! this decorator watches every append and synthesizes placeholder results so
//! the transcript the model sees next turn is always well-formed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use runa_model::{ContentBlock, Message, Role};

use crate::key::SessionKey;
use crate::log::SessionLog;

/// Content of a synthesized result for a tool call that never completed.
pub const SYNTHETIC_RESULT_CONTENT: &str =
    "Tool execution did not complete. This is a synthetic error result.";

/// Decorator around [`SessionLog`] that maintains the pairing invariant.
///
/// One guard serves all sessions of a log instance; each session has its own
/// pending map.  Writers to a session are serialized by the session lane, so
/// the inner mutex only guards cross-session map access.
pub struct ToolResultGuard {
    log: Arc<SessionLog>,
    /// session key → (tool_use_id → tool name)
    pending: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl ToolResultGuard {
    pub fn new(log: Arc<SessionLog>) -> Self {
        Self {
            log,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    /// Append with invariant maintenance; returns the entry id of `msg`.
    pub fn append(&self, key: &SessionKey, msg: &Message) -> anyhow::Result<u64> {
        if msg.is_tool_result_carrier() {
            let mut pending = self.pending.lock().expect("guard lock poisoned");
            if let Some(session_pending) = pending.get_mut(&key.full()) {
                for id in msg.tool_result_ids() {
                    session_pending.remove(id);
                }
            }
            return self.log.append(key, msg);
        }

        // Any non-result append while calls are outstanding means those
        // results are never coming (new user input, fresh assistant turn).
        // Flush placeholders first so the pairing stays intact.
        self.flush_pending(key)?;
        let id = self.log.append(key, msg)?;

        if msg.role == Role::Assistant {
            let mut pending = self.pending.lock().expect("guard lock poisoned");
            let session_pending = pending.entry(key.full()).or_default();
            for block in msg.blocks() {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    session_pending.insert(id.clone(), name.clone());
                }
            }
        }
        Ok(id)
    }

    /// Synthesize results for every outstanding tool call of this session.
    ///
    /// Must be called when a run terminates — success, error, or abort.
    pub fn flush_pending(&self, key: &SessionKey) -> anyhow::Result<()> {
        let drained: Vec<(String, String)> = {
            let mut pending = self.pending.lock().expect("guard lock poisoned");
            match pending.get_mut(&key.full()) {
                Some(session_pending) if !session_pending.is_empty() => {
                    let mut items: Vec<(String, String)> = session_pending.drain().collect();
                    // Deterministic block order regardless of map iteration.
                    items.sort();
                    items
                }
                _ => return Ok(()),
            }
        };

        let blocks: Vec<ContentBlock> = drained
            .into_iter()
            .map(|(id, name)| ContentBlock::tool_result(id, name, SYNTHETIC_RESULT_CONTENT))
            .collect();
        self.log.append(key, &Message::tool_results(blocks))?;
        Ok(())
    }

    /// Drop a session's pending state without synthesizing (used by `reset`).
    pub fn forget(&self, key: &SessionKey) {
        self.pending
            .lock()
            .expect("guard lock poisoned")
            .remove(&key.full());
    }

    /// Number of unanswered tool calls for a session.
    pub fn pending_count(&self, key: &SessionKey) -> usize {
        self.pending
            .lock()
            .expect("guard lock poisoned")
            .get(&key.full())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn guard() -> (TempDir, ToolResultGuard) {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(SessionLog::new(tmp.path()));
        (tmp, ToolResultGuard::new(log))
    }

    fn key() -> SessionKey {
        SessionKey::main("abot")
    }

    fn tool_use_msg(ids: &[&str]) -> Message {
        Message::assistant_blocks(
            ids.iter()
                .map(|id| ContentBlock::tool_use(*id, "list", json!({})))
                .collect(),
        )
    }

    fn result_msg(ids: &[&str]) -> Message {
        Message::tool_results(
            ids.iter()
                .map(|id| ContentBlock::tool_result(*id, "list", "ok"))
                .collect(),
        )
    }

    /// Every tool_use id in the transcript has a matching tool_result id.
    fn pairing_holds(msgs: &[Message]) -> bool {
        let used: Vec<&str> = msgs.iter().flat_map(|m| m.tool_use_ids()).collect();
        let answered: Vec<&str> = msgs.iter().flat_map(|m| m.tool_result_ids()).collect();
        used.iter().all(|id| answered.contains(id))
    }

    #[test]
    fn matched_results_clear_pending() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &tool_use_msg(&["t1"])).unwrap();
        assert_eq!(g.pending_count(&k), 1);
        g.append(&k, &result_msg(&["t1"])).unwrap();
        assert_eq!(g.pending_count(&k), 0);
    }

    #[test]
    fn flush_pending_synthesizes_results() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &tool_use_msg(&["t1"])).unwrap();
        g.flush_pending(&k).unwrap();

        let msgs = g.log().load(&k).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].is_tool_result_carrier());
        assert_eq!(msgs[1].tool_result_ids(), vec!["t1"]);
        assert!(msgs[1].blocks().iter().any(|b| matches!(
            b,
            ContentBlock::ToolResult { content, .. } if content == SYNTHETIC_RESULT_CONTENT
        )));
        assert!(pairing_holds(&msgs));
    }

    #[test]
    fn flush_with_nothing_pending_appends_nothing() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &Message::user("hi")).unwrap();
        g.flush_pending(&k).unwrap();
        assert_eq!(g.log().load(&k).unwrap().len(), 1);
    }

    #[test]
    fn non_result_append_flushes_first() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &tool_use_msg(&["t1"])).unwrap();
        // A fresh user message arrives instead of the result.
        g.append(&k, &Message::user("never mind")).unwrap();

        let msgs = g.log().load(&k).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].tool_result_ids(), vec!["t1"]);
        assert_eq!(msgs[2].text(), "never mind");
        assert!(pairing_holds(&msgs));
    }

    #[test]
    fn multiple_pending_ids_flushed_in_sorted_order() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &tool_use_msg(&["t3", "t1", "t2"])).unwrap();
        g.flush_pending(&k).unwrap();
        let msgs = g.log().load(&k).unwrap();
        assert_eq!(msgs[1].tool_result_ids(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn partial_results_leave_remainder_pending() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &tool_use_msg(&["t1", "t2"])).unwrap();
        g.append(&k, &result_msg(&["t1"])).unwrap();
        assert_eq!(g.pending_count(&k), 1);
        g.flush_pending(&k).unwrap();
        let msgs = g.log().load(&k).unwrap();
        assert!(pairing_holds(&msgs));
    }

    #[test]
    fn sessions_do_not_share_pending_maps() {
        let (_tmp, g) = guard();
        let a = SessionKey::main("abot");
        let b = SessionKey::named("abot", "other").unwrap();
        g.append(&a, &tool_use_msg(&["t1"])).unwrap();
        assert_eq!(g.pending_count(&a), 1);
        assert_eq!(g.pending_count(&b), 0);
        g.flush_pending(&b).unwrap();
        assert_eq!(g.pending_count(&a), 1, "flushing b must not touch a");
    }

    #[test]
    fn forget_drops_pending_without_writing() {
        let (_tmp, g) = guard();
        let k = key();
        g.append(&k, &tool_use_msg(&["t1"])).unwrap();
        g.forget(&k);
        assert_eq!(g.pending_count(&k), 0);
        assert_eq!(g.log().load(&k).unwrap().len(), 1);
    }

    #[test]
    fn reload_after_flush_satisfies_pairing() {
        // The S6 scenario: assistant tool_use, abort, flush, reload.
        let (tmp, g) = guard();
        let k = key();
        g.append(&k, &Message::user("go")).unwrap();
        g.append(&k, &tool_use_msg(&["t1"])).unwrap();
        g.flush_pending(&k).unwrap();

        let reopened = SessionLog::new(tmp.path());
        let msgs = reopened.load(&k).unwrap();
        assert!(pairing_holds(&msgs));
    }
}
