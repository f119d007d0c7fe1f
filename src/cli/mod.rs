//! Command-line interface.

pub mod commands;

use clap::{Args, Parser, Subcommand};

/// L3KV node binary.
#[derive(Debug, Parser)]
#[command(name = "l3kv", version, about = "Sharded multi-master key-value store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a node.
    Start(StartArgs),
    /// Dump and verify a write-ahead log offline.
    InspectWal(InspectWalArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/l3kv.toml")]
    pub config: String,
}

#[derive(Debug, Args)]
pub struct InspectWalArgs {
    /// Path of the WAL file to inspect.
    pub path: String,

    /// Print each record instead of just the summary.
    #[arg(long)]
    pub verbose: bool,
}
