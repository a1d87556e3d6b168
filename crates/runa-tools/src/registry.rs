// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::policy::ToolPolicy;
use crate::tool::{Tool, ToolContext};

/// A tool schema as forwarded to the model.  Mirrors the model crate's
/// schema type but keeps the tools crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Outcome of one tool execution.  Errors are carried as content — the
/// registry is the seam where tool failures stop being `Err`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas for tools that pass every given policy layer.
    pub fn schemas_filtered(&self, layers: &[&ToolPolicy]) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| crate::policy::allowed_by_all(&s.name, layers))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a tool by name.  Unknown tools and execution failures become
    /// error outcomes, never panics or propagated errors.
    pub async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome {
                content: format!("unknown tool: {name}"),
                is_error: true,
            };
        };
        match tool.execute(input, ctx).await {
            Ok(content) => ToolOutcome {
                content,
                is_error: false,
            },
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                ToolOutcome {
                    content: format!("Error: {e:#}"),
                    is_error: true,
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
