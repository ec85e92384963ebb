//! Dualtrack operator CLI
//!
//! Opens a RocksDB-backed memory store and runs one maintenance or
//! inspection command against it. Output is JSON on stdout; logs go to
//! stderr.

mod commands;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dualtrack_memory::{MemoryConfig, MemorySystem};

use crate::commands::Command;

#[derive(Parser)]
#[command(name = "dualtrack")]
#[command(about = "Inspect and maintain a dual-track memory store")]
#[command(version)]
struct Args {
    /// Directory holding the RocksDB store
    #[arg(long, short, default_value = ".dualtrack")]
    data_dir: PathBuf,

    /// Embedding dimension (overrides DUALTRACK_DIMENSION)
    #[arg(long)]
    dimension: Option<usize>,

    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = if args.verbose {
        "dualtrack=debug,dualtrack_memory=debug"
    } else {
        "dualtrack=info,dualtrack_memory=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = MemoryConfig::from_env();
    if let Some(dimension) = args.dimension {
        config.dimension = dimension;
    }

    tracing::info!(data_dir = ?args.data_dir, "opening memory store");
    let system = MemorySystem::open_rocks(&args.data_dir, config)
        .with_context(|| format!("failed to open store at {}", args.data_dir.display()))?;

    let output = commands::execute(&system, args.command).await?;
    let (flushed, failed) = system.flush().await;
    if failed > 0 {
        tracing::warn!(flushed, failed, "some cached changes were not persisted");
    }

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
