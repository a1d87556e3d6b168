// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ProviderEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// The wire contract a model provider must satisfy.
///
/// Adapters for concrete APIs live in the embedding application; the runtime
/// only consumes this trait (and ships a scripted mock for tests).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// One-shot, non-streaming completion used by the compaction summarizer.
    ///
    /// The default implementation refuses; providers that cannot serve
    /// plain completions leave it unimplemented and compaction falls back to
    /// its deterministic summary.
    async fn complete_simple(
        &self,
        _system: &str,
        _user_prompt: &str,
        _max_tokens: u32,
    ) -> anyhow::Result<String> {
        anyhow::bail!("provider {} does not support plain completions", self.name())
    }
}
