//! ZoneSync CLI
//!
//! Operator tools for file-backed ZoneSync stores.
//!
//! # Commands
//!
//! - `inspect` - List shadow records by entity and change type
//! - `state` - Show the sync cursor and bootstrap flags
//! - `reset-cursor` - Forget the cursor so the next run reads the whole zone
//! - `reset-bootstrap` - Forget that the zone and subscription exist
//!
//! Resets take the store's exclusive lock, so they refuse to run next to
//! an open session.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zonesync_protocol::ChangeType;

/// ZoneSync command-line store tools.
#[derive(Parser)]
#[command(name = "zonesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// List shadow records
    Inspect {
        /// Only records of this entity
        #[arg(short, long)]
        entity: Option<String>,

        /// Only records with this change type
        #[arg(short, long, value_enum)]
        change_type: Option<ChangeFilter>,

        /// Print attribute values
        #[arg(short, long)]
        attributes: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the sync cursor and bootstrap flags
    State {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear the sync cursor; the next run is a full resync
    ResetCursor,

    /// Clear the zone and subscription flags; the next run bootstraps again
    ResetBootstrap,

    /// Show version information
    Version,
}

/// Change type accepted on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum ChangeFilter {
    /// Synced records
    NoChange,
    /// Records waiting to be saved remotely
    Updated,
    /// Tombstones waiting to be deleted remotely
    Deleted,
}

impl From<ChangeFilter> for ChangeType {
    fn from(filter: ChangeFilter) -> Self {
        match filter {
            ChangeFilter::NoChange => ChangeType::NoChange,
            ChangeFilter::Updated => ChangeType::Updated,
            ChangeFilter::Deleted => ChangeType::Deleted,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            entity,
            change_type,
            attributes,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(
                &path,
                entity.as_deref(),
                change_type.map(ChangeType::from),
                attributes,
                &format,
            )?;
        }
        Commands::State { format } => {
            let path = cli.path.ok_or("Store path required for state")?;
            commands::state::run(&path, &format)?;
        }
        Commands::ResetCursor => {
            let path = cli.path.ok_or("Store path required for reset-cursor")?;
            commands::reset::cursor(&path)?;
        }
        Commands::ResetBootstrap => {
            let path = cli.path.ok_or("Store path required for reset-bootstrap")?;
            commands::reset::bootstrap(&path)?;
        }
        Commands::Version => {
            println!("ZoneSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
