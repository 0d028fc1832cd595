//! progsync CLI
//!
//! Command-line tools for inspecting and maintaining a progsync queue file.
//!
//! # Commands
//!
//! - `stats` - Display record counts per status
//! - `list` - List queued operations
//! - `requeue-failed` - Return Failed operations to Pending
//! - `cleanup` - Delete old Completed and Failed operations
//! - `retries` - Show the persisted retry ledger
//! - `compact` - Rewrite the log to reclaim space
//! - `clear` - Delete every queued operation

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use progsync_engine::OperationStatus;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// progsync command-line queue tools.
#[derive(Parser)]
#[command(name = "progsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Status filter for `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StatusFilter {
    Pending,
    Completed,
    Failed,
    Manual,
}

impl From<StatusFilter> for OperationStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => OperationStatus::Pending,
            StatusFilter::Completed => OperationStatus::Completed,
            StatusFilter::Failed => OperationStatus::Failed,
            StatusFilter::Manual => OperationStatus::ManualResolution,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Display record counts per status
    Stats {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List queued operations, oldest first
    List {
        /// Only show operations with this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Return every Failed operation to Pending
    RequeueFailed,

    /// Delete Completed and Failed operations older than a number of days
    Cleanup {
        /// Age threshold in days
        #[arg(short, long, default_value = "30")]
        max_age_days: u32,
    },

    /// Show the persisted retry ledger
    Retries {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Rewrite the queue file to reclaim space
    Compact,

    /// Delete every queued operation and retry record
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Stats { format } => {
            let path = cli.path.ok_or("Queue path required for stats")?;
            commands::stats::run(&path, format)?;
        }
        Commands::List { status, format } => {
            let path = cli.path.ok_or("Queue path required for list")?;
            commands::list::run(&path, status.map(OperationStatus::from), format)?;
        }
        Commands::RequeueFailed => {
            let path = cli.path.ok_or("Queue path required for requeue-failed")?;
            commands::maintenance::requeue_failed(&path)?;
        }
        Commands::Cleanup { max_age_days } => {
            let path = cli.path.ok_or("Queue path required for cleanup")?;
            commands::maintenance::cleanup(&path, max_age_days)?;
        }
        Commands::Retries { format } => {
            let path = cli.path.ok_or("Queue path required for retries")?;
            commands::retries::run(&path, format)?;
        }
        Commands::Compact => {
            let path = cli.path.ok_or("Queue path required for compact")?;
            commands::compact::run(&path)?;
        }
        Commands::Clear { yes } => {
            let path = cli.path.ok_or("Queue path required for clear")?;
            commands::maintenance::clear(&path, yes)?;
        }
        Commands::Version => {
            println!("progsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Client version {}", progsync_protocol::CLIENT_VERSION);
        }
    }

    Ok(())
}
