// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    provider::ResponseStream, CompletionRequest, ProviderEvent, Role, ToolInvocation,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let text = format!("MOCK: {reply}");
        let events: Vec<anyhow::Result<ProviderEvent>> = vec![
            Ok(ProviderEvent::TextDelta {
                delta: text.clone(),
            }),
            Ok(ProviderEvent::TextEnd { content: text }),
            Ok(ProviderEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One pre-scripted provider call: either an event sequence or a failure.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    Events(Vec<ProviderEvent>),
    /// `stream()` returns this error text wrapped in `anyhow::Error`.
    Fail(String),
}

/// A pre-scripted mock provider.  Each call to `stream` pops the next
/// script from the front of the queue.  This lets tests specify exact
/// event sequences — including tool calls and error turns — without
/// network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<VecDeque<ScriptedCall>>>,
    /// Replies served by `complete_simple`, front first.  When exhausted,
    /// `"SUMMARY"` is returned so compaction tests have a stable default.
    simple_replies: Arc<Mutex<VecDeque<String>>>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Number of `stream()` calls made so far.
    pub stream_calls: Arc<Mutex<u32>>,
}

impl ScriptedMockProvider {
    /// Build a provider from an ordered list of per-call scripts.
    pub fn new(scripts: Vec<ScriptedCall>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            simple_replies: Arc::new(Mutex::new(VecDeque::new())),
            last_request: Arc::new(Mutex::new(None)),
            stream_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue a reply for the next `complete_simple` call.
    pub fn push_simple_reply(&self, reply: impl Into<String>) {
        self.simple_replies.lock().unwrap().push_back(reply.into());
    }

    /// Event sequence for a plain streamed text turn.
    pub fn text_turn(text: impl Into<String>) -> Vec<ProviderEvent> {
        let t = text.into();
        vec![
            ProviderEvent::TextDelta { delta: t.clone() },
            ProviderEvent::TextEnd { content: t },
            ProviderEvent::Done,
        ]
    }

    /// Event sequence for a turn that requests the given tool calls.
    pub fn tool_turn(calls: Vec<(&str, &str, Value)>) -> Vec<ProviderEvent> {
        let mut events = Vec::with_capacity(calls.len() + 1);
        for (id, name, arguments) in calls {
            events.push(ProviderEvent::ToolCallStart {
                id: id.into(),
                name: name.into(),
            });
            events.push(ProviderEvent::ToolCallEnd {
                call: ToolInvocation {
                    id: id.into(),
                    name: name.into(),
                    arguments,
                },
            });
        }
        events.push(ProviderEvent::Done);
        events
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedCall::Events(Self::text_turn(reply))])
    }

    /// Convenience: provider that emits one tool call, then a text reply.
    pub fn tool_then_text(
        tool_id: &str,
        tool_name: &str,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedCall::Events(Self::tool_turn(vec![(tool_id, tool_name, args)])),
            ScriptedCall::Events(Self::text_turn(final_text)),
        ])
    }

    /// Convenience: provider whose first call fails with `error`, then
    /// succeeds with a text reply.
    pub fn fail_then_text(error: impl Into<String>, final_text: impl Into<String>) -> Self {
        Self::new(vec![
            ScriptedCall::Fail(error.into()),
            ScriptedCall::Events(Self::text_turn(final_text)),
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.stream_calls.lock().unwrap() += 1;
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.pop_front()
        };
        let events = match script {
            // Default fallback when all scripts are consumed
            None => Self::text_turn("[no more scripts]"),
            Some(ScriptedCall::Events(events)) => events,
            Some(ScriptedCall::Fail(msg)) => return Err(anyhow::anyhow!(msg)),
        };
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }

    async fn complete_simple(
        &self,
        _system: &str,
        _user_prompt: &str,
        _max_tokens: u32,
    ) -> anyhow::Result<String> {
        let reply = self.simple_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| "SUMMARY".into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
