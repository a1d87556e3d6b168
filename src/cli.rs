// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Thin CLI over the runa agent runtime.
///
/// Everything here goes through the public runtime API; the CLI holds no
/// agent state of its own.
#[derive(Parser, Debug)]
#[command(name = "runa", version, about = "An embeddable AI agent runtime")]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message to the agent and stream the reply to stdout.
    Run {
        /// The user message.  An input starting with `/` is routed through
        /// the skill command layer first.
        message: String,

        /// Session id or full `agent:<id>:<tail>` key.  Defaults to the
        /// agent's main session.
        #[arg(long, short = 's')]
        session: Option<String>,

        /// Print tool execution traffic to stderr as it happens.
        #[arg(long)]
        show_tools: bool,
    },

    /// List stored sessions.
    Sessions,

    /// Print a session transcript.
    History {
        /// Session id or full session key.
        session: String,

        /// Emit raw JSON records instead of markdown.
        #[arg(long)]
        json: bool,
    },

    /// Delete a session transcript.
    Reset {
        /// Session id or full session key.
        session: String,
    },

    /// Print the merged configuration and exit.
    ShowConfig,

    /// Deliver the workspace HEARTBEAT.md to the agent once and print the
    /// reply.
    Heartbeat,
}
