// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cagent — an agentic runtime: multi-agent LLM loop with tools, MCP
/// servers, and persistent task tracking.
#[derive(Parser, Debug)]
#[command(name = "cagent", version, about, args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Explicit config file (merged over the discovered ones).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (or set RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Override the task-list id (defaults to one derived from the git
    /// repository, shared across worktrees).
    #[arg(long, global = true)]
    pub task_list: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Task to run when no subcommand is given (same as `exec`).
    pub task: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task headless and stream the answer to stdout.
    Exec {
        /// The task for the agent.
        task: String,
        /// Agent to run (defaults to the configured root agent).
        #[arg(long, short = 'a')]
        agent: Option<String>,
    },

    /// List the tools the configured toolsets expose.
    ListTools,

    /// Print the merged configuration and exit.
    ShowConfig,
}
