//! docwatch CLI
//!
//! Command-line tools for exercising watch loops and managing checkpoints.
//!
//! # Commands
//!
//! - `replay` - Apply a write script to an in-memory feed and watch it
//! - `checkpoint` - Show, reset or rewind a checkpoint file
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docwatch change-feed tools.
#[derive(Parser)]
#[command(name = "docwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the checkpoint file
    #[arg(global = true, short, long)]
    checkpoint: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a JSON-lines write script, then watch it from the checkpoint
    Replay {
        /// Write script, one operation per line
        script: PathBuf,

        /// Collection to watch
        #[arg(long, default_value = "hosts")]
        collection: String,

        /// Deliver batches of up to this many events instead of single events
        #[arg(short, long)]
        batch: Option<usize>,

        /// Tail only, skipping the listing pass
        #[arg(long)]
        no_list: bool,

        /// Comma-separated fields to project
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Maximum handler invocations per unit
        #[arg(long, default_value = "10")]
        max_retry: u32,

        /// Delay between handler invocations, in milliseconds
        #[arg(long, default_value = "1000")]
        retry_delay_ms: u64,

        /// Stop after this long without deliveries, in milliseconds
        #[arg(long, default_value = "1500")]
        idle_ms: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Inspect or modify a checkpoint file
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored start point
    Show {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Remove the checkpoint so the next watch lists from scratch
    Reset,
    /// Replace the checkpoint with a start time (`seconds.ordinal`)
    SetTime {
        /// Cluster time to start from
        time: String,
    },
}

/// `RUST_LOG` directives win over the `--verbose` level when they parse.
fn log_filter(verbose: bool, directives: Option<String>) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = log_filter(cli.verbose, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            script,
            collection,
            batch,
            no_list,
            fields,
            max_retry,
            retry_delay_ms,
            idle_ms,
            format,
        } => {
            let checkpoint = cli.checkpoint.ok_or("Checkpoint path required for replay")?;
            let args = commands::replay::ReplayArgs {
                script,
                checkpoint,
                collection,
                batch,
                list_first: !no_list,
                fields,
                max_retry,
                retry_delay_ms,
                idle_ms,
                format: format.parse()?,
            };
            commands::replay::run(&args)?;
        }
        Commands::Checkpoint { action } => {
            let path = cli.checkpoint.ok_or("Checkpoint path required")?;
            match action {
                CheckpointAction::Show { format } => {
                    commands::checkpoint::show(&path, format.parse()?)?;
                }
                CheckpointAction::Reset => commands::checkpoint::reset(&path)?,
                CheckpointAction::SetTime { time } => {
                    commands::checkpoint::set_time(&path, &time)?;
                }
            }
        }
        Commands::Version => {
            println!("docwatch CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Channel capacity {}", docwatch_engine::DEFAULT_CHANNEL_CAPACITY);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_verbosity() {
        let filter = log_filter(false, Some("docwatch_engine=trace".into()));
        assert!(filter.to_string().contains("docwatch_engine=trace"));
    }

    #[test]
    fn verbosity_applies_without_rust_log() {
        assert_eq!(log_filter(true, None).to_string(), "debug");
        assert_eq!(log_filter(false, Some("  ".into())).to_string(), "info");
        assert_eq!(log_filter(false, Some("hosts=loudest".into())).to_string(), "info");
    }
}
