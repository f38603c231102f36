//! Tideline CLI
//!
//! Command-line tools for looking into a Tideline cache file while the
//! application is not running.
//!
//! # Commands
//!
//! - `inspect` - Show the records and pending queues of a namespace
//! - `journal` - Dump the error journal
//! - `clear-journal` - Empty the error journal

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tideline_engine::{DEFAULT_ID_ATTRIBUTE, DEFAULT_JOURNAL_KEY};
use tracing_subscriber::EnvFilter;

/// Tideline cache inspection tools.
#[derive(Parser)]
#[command(name = "tideline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the cache file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the records and pending queues of a namespace
    Inspect {
        /// Collection namespace, e.g. "/todos"
        namespace: String,

        /// Identity attribute of the records
        #[arg(short, long, default_value = DEFAULT_ID_ATTRIBUTE)]
        id_attribute: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the error journal
    Journal {
        /// Storage key of the journal
        #[arg(short, long, default_value = DEFAULT_JOURNAL_KEY)]
        key: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Empty the error journal
    ClearJournal {
        /// Storage key of the journal
        #[arg(short, long, default_value = DEFAULT_JOURNAL_KEY)]
        key: String,
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

    match cli.command {
        Commands::Inspect {
            namespace,
            id_attribute,
            format,
        } => {
            let path = cli.path.ok_or("Cache path required for inspect")?;
            commands::inspect::run(&path, &namespace, &id_attribute, &format)?;
        }
        Commands::Journal { key, format } => {
            let path = cli.path.ok_or("Cache path required for journal")?;
            commands::journal::run(&path, &key, &format)?;
        }
        Commands::ClearJournal { key } => {
            let path = cli.path.ok_or("Cache path required for clear-journal")?;
            commands::journal::clear(&path, &key)?;
        }
        Commands::Version => {
            println!("Tideline CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
