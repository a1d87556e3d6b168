// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use runa_core::{Agent, AgentEvent};
use runa_model::{Message, MockProvider, ModelProvider, Role};
use runa_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = runa_config::load(cli.config.as_deref())?;

    if let Commands::ShowConfig = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Read-only commands never reach the model; don't demand a provider
    // for them.
    let provider: Arc<dyn ModelProvider> = match cli.command {
        Commands::Run { .. } | Commands::Heartbeat => build_provider(&config)?,
        _ => Arc::new(MockProvider),
    };
    let agent = Agent::new(config, provider, ToolRegistry::new())?;

    match cli.command {
        Commands::ShowConfig => unreachable!("handled above"),
        Commands::Run {
            message,
            session,
            show_tools,
        } => run_once(&agent, session.as_deref(), &message, show_tools).await,
        Commands::Sessions => {
            for key in agent.list_sessions()? {
                println!("{key}");
            }
            Ok(())
        }
        Commands::History { session, json } => print_history(&agent, &session, json),
        Commands::Reset { session } => agent.reset(&session),
        Commands::Heartbeat => run_heartbeat(&agent).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// The CLI ships only the mock provider; real wire adapters are supplied by
/// the application embedding the runtime.
fn build_provider(config: &runa_config::Config) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match config.model.provider.as_str() {
        "mock" => Ok(Arc::new(MockProvider)),
        other => anyhow::bail!(
            "unknown provider '{other}': this binary bundles only the 'mock' provider; \
             embed the runtime to wire a real one"
        ),
    }
}

async fn run_once(
    agent: &Agent,
    session: Option<&str>,
    message: &str,
    show_tools: bool,
) -> anyhow::Result<()> {
    let mut events = agent.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                AgentEvent::MessageDelta { delta } => {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolExecutionStart { name, .. } if show_tools => {
                    eprintln!("[tool] {name} …");
                }
                AgentEvent::ToolExecutionEnd {
                    name, is_error, ..
                } if show_tools => {
                    eprintln!("[tool] {name} {}", if is_error { "failed" } else { "ok" });
                }
                AgentEvent::AgentEnd | AgentEvent::AgentError { .. } => break,
                _ => {}
            }
        }
    });

    let session = session.unwrap_or("main");
    let outcome = agent.run(session, message).await;
    let _ = printer.await;
    let outcome = outcome.context("run failed")?;
    println!();
    eprintln!(
        "({} turn(s), {} tool call(s), run {})",
        outcome.turns, outcome.tool_calls, outcome.run_id
    );
    Ok(())
}

fn print_history(agent: &Agent, session: &str, json: bool) -> anyhow::Result<()> {
    let messages = agent.get_history(session)?;
    if json {
        for msg in &messages {
            println!("{}", serde_json::to_string(msg)?);
        }
        return Ok(());
    }
    for msg in &messages {
        let role = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        println!("## {role}\n");
        let text = render_message(msg);
        println!("{text}\n");
    }
    Ok(())
}

fn render_message(msg: &Message) -> String {
    let blocks = msg.blocks();
    if blocks.is_empty() {
        return msg.text();
    }
    blocks
        .iter()
        .map(|block| match block {
            runa_model::ContentBlock::Text { text } => text.clone(),
            runa_model::ContentBlock::ToolUse { name, input, .. } => {
                format!("[tool_use: {name}({input})]")
            }
            runa_model::ContentBlock::ToolResult { name, content, .. } => {
                format!("[tool_result {name}: {content}]")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_heartbeat(agent: &Agent) -> anyhow::Result<()> {
    let path = std::env::current_dir()?.join("HEARTBEAT.md");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let content = runa_heartbeat::effective_content(&raw);
    if content.is_empty() {
        eprintln!("HEARTBEAT.md has no actionable content; nothing to do");
        return Ok(());
    }
    let outcome = agent.run("main", &content).await?;
    println!("{}", outcome.text);
    Ok(())
}
