// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sven_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "sven",
    about = "An efficient AI coding agent for CLI and CI",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// The task to run. Omitted with stdin piped in, the prompt is read from stdin.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Agent mode
    #[arg(long, short = 'm', value_enum, default_value = "agent")]
    pub mode: AgentMode,

    /// Model to use, e.g. "gpt-4o" or "claude-opus-4-5" (overrides config)
    #[arg(long, short = 'M', env = "SVEN_MODEL")]
    pub model: Option<String>,

    /// Resume a previously created session by id
    #[arg(long, value_name = "ID")]
    pub resume: Option<String>,

    /// Path to a config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration and exit
    ShowConfig,
    /// List known models from the static catalog
    ListModels {
        /// Only show models for this provider id
        #[arg(long)]
        provider: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List supported model providers
    ListProviders {
        /// Show API key env var and default URL per provider
        #[arg(long, short = 'v')]
        verbose: bool,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved sessions
    Sessions,
}

impl Cli {
    /// `true` when stdin is not an interactive terminal, meaning a prompt
    /// may be piped in rather than passed as an argument.
    pub fn has_piped_stdin(&self) -> bool {
        !is_stdin_tty()
    }
}

fn is_stdin_tty() -> bool {
    #[cfg(unix)]
    {
        use std::io::IsTerminal;
        std::io::stdin().is_terminal()
    }
    #[cfg(not(unix))]
    {
        false
    }
}
