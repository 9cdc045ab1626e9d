//! docsync CLI
//!
//! Offline tools for a docsync local store. The engine must not be running
//! on the same directory; the store's directory lock enforces this.
//!
//! # Commands
//!
//! - `inspect` - Namespaces and per-state document counts
//! - `verify` - Check that no interrupted write is left behind
//! - `recover` - Roll back interrupted writes
//! - `dump-events` - Print pending change events

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync command-line maintenance tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Instance key to operate on (default: every instance in the store)
    #[arg(global = true, short, long)]
    instance_key: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display namespaces and synchronization state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify that undo journals are empty and bookkeeping is consistent
    Verify,

    /// Roll back interrupted local writes
    Recover {
        /// Dry run - list the undo entries without touching the store
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump pending change events
    DumpEvents {
        /// Only this namespace, as `database.collection`
        #[arg(short, long)]
        namespace: Option<String>,

        /// Maximum number of events to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let instance_key = cli.instance_key.as_deref();
    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, instance_key, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, instance_key)?;
        }
        Commands::Recover { dry_run } => {
            let path = cli.path.ok_or("Store path required for recover")?;
            commands::recover::run(&path, instance_key, dry_run)?;
        }
        Commands::DumpEvents {
            namespace,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-events")?;
            commands::dump_events::run(&path, instance_key, namespace.as_deref(), limit, &format)?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("sync protocol v{}", docsync_protocol::SYNC_PROTOCOL_VERSION);
        }
    }

    Ok(())
}
