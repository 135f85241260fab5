//! twinstore CLI
//!
//! Operator tools for master/replica pairs stored as JSON snapshots.
//!
//! # Commands
//!
//! - `resync` - Repair a replica snapshot from its master
//! - `verify` - Report divergence between master and replica without repairing

mod commands;

use clap::{Parser, Subcommand};
use commands::resync::ResyncArgs;
use commands::snapshot::Sources;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// twinstore master/replica reconciliation tools.
#[derive(Parser)]
#[command(name = "twinstore")]
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
    /// Repair a replica snapshot from its master
    Resync {
        /// Schema file describing the record type
        #[arg(long)]
        schema: PathBuf,

        /// Master snapshot
        #[arg(long)]
        master: PathBuf,

        /// Replica snapshot
        #[arg(long)]
        replica: PathBuf,

        /// Fraction of full speed to run at (0-1)
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Only sweep rows matching property=value
        #[arg(long)]
        filter: Option<String>,

        /// Rows between replica commits
        #[arg(long, default_value = "1000")]
        commit_interval: u64,

        /// Run repairs on a dedicated worker thread
        #[arg(long)]
        worker: bool,

        /// Write the repaired replica snapshot here
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Report divergence between master and replica without repairing
    Verify {
        /// Schema file describing the record type
        #[arg(long)]
        schema: PathBuf,

        /// Master snapshot
        #[arg(long)]
        master: PathBuf,

        /// Replica snapshot
        #[arg(long)]
        replica: PathBuf,

        /// Only compare rows matching property=value
        #[arg(long)]
        filter: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr, reports to stdout.
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
        Commands::Resync {
            schema,
            master,
            replica,
            speed,
            filter,
            commit_interval,
            worker,
            out,
            format,
        } => {
            let sources = Sources {
                schema,
                master,
                replica,
            };
            let args = ResyncArgs {
                speed,
                filter,
                commit_interval,
                worker,
            };
            commands::resync::run(&sources, &args, out.as_deref(), &format)?;
        }
        Commands::Verify {
            schema,
            master,
            replica,
            filter,
            format,
        } => {
            let sources = Sources {
                schema,
                master,
                replica,
            };
            commands::verify::run(&sources, filter.as_deref(), &format)?;
        }
        Commands::Version => {
            println!("twinstore CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
