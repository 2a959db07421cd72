//! shmbuf CLI - administration of shared buffer stores.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// shmbuf - shared-memory buffer pool administration.
#[derive(Parser)]
#[command(name = "shmbuf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Store directory (overrides the config file and SHMBUF_DIR)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Path to a YAML store configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the allocated and free lists
    Dump,

    /// Show capacity and per-bucket usage
    Stats,

    /// Return stranded buffers to the free list
    Repair {
        /// Only repair buffers stamped by this instance id
        #[arg(short, long, conflicts_with = "buffer")]
        instance: Option<u32>,

        /// Repair a single buffer, given as its raw 32-bit ref
        #[arg(short, long)]
        buffer: Option<u32>,
    },

    /// Show version information
    Version,
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // RUST_LOG wins over -v
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let source = commands::StoreSource {
        dir: cli.dir,
        config: cli.config,
    };

    match cli.command {
        Commands::Dump => commands::dump::run(&source),
        Commands::Stats => commands::stats::run(&source),
        Commands::Repair { instance, buffer } => commands::repair::run(&source, instance, buffer),
        Commands::Version => commands::version::run(),
    }
}
