//! tasksync CLI
//!
//! Command-line front end for the tasksync reconciliation engine.
//!
//! # Commands
//!
//! - `sync` - Run one cycle over JSON-file backends
//! - `inspect` - Summarize the snapshots and mapping table of a state directory
//! - `verify` - Check a state directory for inconsistencies
//! - `demo` - Reconcile two seeded in-memory backends

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Keeps tasks consistent across task-tracking backends.
#[derive(Parser)]
#[command(name = "tasksync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle
    Sync {
        /// State directory holding snapshots and the mapping table
        #[arg(short, long)]
        state: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Backend as NAME=PATH to a JSON task file (repeatable)
        #[arg(short, long = "backend", required = true)]
        backends: Vec<String>,

        /// Show the plan without executing it
        #[arg(short, long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Summarize a state directory
    Inspect {
        /// State directory
        #[arg(short, long)]
        state: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check a state directory for inconsistencies
    Verify {
        /// State directory
        #[arg(short, long)]
        state: PathBuf,
    },

    /// Reconcile two seeded in-memory backends and show the result
    Demo,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync {
            state,
            config,
            backends,
            dry_run,
            format,
        } => {
            commands::sync::run(&state, config.as_deref(), &backends, dry_run, &format)?;
        }
        Commands::Inspect { state, format } => {
            commands::inspect::run(&state, &format)?;
        }
        Commands::Verify { state } => {
            commands::verify::run(&state)?;
        }
        Commands::Demo => {
            commands::demo::run()?;
        }
        Commands::Version => {
            println!("tasksync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
