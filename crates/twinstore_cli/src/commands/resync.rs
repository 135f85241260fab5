//! Resync command implementation.

use super::snapshot::{parse_filter, print_report, write_rows, LoadedPair, Sources};
use std::path::Path;
use tracing::info;
use twinstore_core::{ResyncOptions, ResyncReport, WorkerOptions};
use twinstore_storage::Repository;

/// Settings of one resync run.
#[derive(Debug, Clone)]
pub struct ResyncArgs {
    /// Fraction of full speed to run at.
    pub speed: f64,
    /// Optional `property=value` restriction.
    pub filter: Option<String>,
    /// Rows between replica commits.
    pub commit_interval: u64,
    /// Repairs on a dedicated worker thread.
    pub worker: bool,
}

/// Loads both snapshots, repairs the replica and returns the report.
pub fn sweep(sources: &Sources, args: &ResyncArgs, out: Option<&Path>) -> Result<ResyncReport, Box<dyn std::error::Error>> {
    let pair = LoadedPair::open(sources)?;
    let mut options = ResyncOptions::new()
        .with_speed(args.speed)
        .with_commit_interval(args.commit_interval);
    if let Some(filter) = &args.filter {
        options = options.with_filter(parse_filter(&pair.schema, filter)?);
    }
    if args.worker {
        options = options.with_worker(WorkerOptions::default());
    }

    let report = pair.repo.resync_with(&pair.schema, &options)?;
    if let Some(out) = out {
        write_rows(pair.replica_storage()?.as_ref(), out)?;
        info!(path = %out.display(), "repaired replica written");
    }
    pair.repo.close()?;
    Ok(report)
}

/// Runs the resync command.
pub fn run(
    sources: &Sources,
    args: &ResyncArgs,
    out: Option<&Path>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = sweep(sources, args, out)?;
    print_report(&report, format)?;
    if report.failed > 0 {
        return Err(format!("{} divergences could not be repaired", report.failed).into());
    }
    Ok(())
}
