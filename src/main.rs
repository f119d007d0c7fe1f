//! L3KV node binary.
//!
//! Usage:
//!   l3kv start --config config/l3kv.toml
//!   l3kv inspect-wal data/node1.wal [--verbose]

use anyhow::Result;
use clap::Parser;
use l3kv::cli::commands::{run_inspect_wal, run_start};
use l3kv::cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::InspectWal(args) => run_inspect_wal(args),
    }
}
