//! cloneline - Shard-parallel code clone detection pipeline
//!
//! Tokenizes project files shard by shard, interns tokens and clone
//! groups per shard, and folds finished shards into a single result
//! through a memoized binary merge tree.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "cloneline")]
#[command(about = "Shard-parallel code clone detection pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./cloneline.toml or ~/.config/cloneline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Tokenize and intern one shard of the corpus
    Ingest(cmd::ingest::IngestArgs),
    /// Merge finished shards into one result
    Merge(cmd::merge::MergeArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(cloneline_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug  — progress bars show activity
    //   non-TTY: info unless --debug          — logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    cloneline_core::init_logging(quiet, cli.debug, multi);

    // Load configuration
    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Ingest(args) => cmd::ingest::run(args, &config, &progress),
        Command::Merge(args) => cmd::merge::run(args, &config, &progress),
        Command::Config => {
            eprintln!("Output directory:  {}", config.output.default_dir.display());
            eprintln!(
                "Workers:           {} (max: {})",
                config.workers.default, config.workers.max
            );
            eprintln!("Extensions:        {}", config.ingest.extensions.join(", "));
            eprintln!("Max file size:     {} bytes", config.ingest.max_file_bytes);
            eprintln!("Queue capacity:    {}", config.ingest.queue_capacity);
            Ok(())
        }
    }
}
