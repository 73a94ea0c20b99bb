//! Main CLI parser and top-level argument handling.

use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

/// Aggregate many upstream MCP servers behind one proxy.
#[derive(Parser)]
#[command(name = "upmux")]
#[command(about = "Supervise upstream MCP server connections")]
#[command(version)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.upmux/config.json)
    #[arg(short = 'c', long = "config", env = "UPMUX_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}
