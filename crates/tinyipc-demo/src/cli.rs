//! Command-line interface of the demo parent.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tinyipc-parent - launch a worker and call it
#[derive(Debug, Parser)]
#[command(name = "tinyipc-parent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Worker executable (defaults to tinyipc-worker next to this binary)
    #[arg(long, short, env = "TINYIPC_WORKER")]
    pub worker: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, short, env = "TINYIPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Default call timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands. Without one, a short demo session runs.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Make a single call and print its result
    Call {
        /// Method name
        method: String,

        /// JSON parameters
        #[arg(default_value = "null")]
        params: String,
    },

    /// Issue many concurrent calls and report how long they took
    Bench {
        /// Number of calls
        #[arg(long, default_value_t = 100)]
        calls: usize,
    },
}
