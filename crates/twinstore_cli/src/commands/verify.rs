//! Verify command implementation.

use super::snapshot::{parse_filter, print_report, LoadedPair, Sources};
use twinstore_core::{ResyncOptions, ResyncReport};
use twinstore_storage::Repository;

/// Compares both snapshots without changing anything.
pub fn compare(sources: &Sources, filter: Option<&str>) -> Result<ResyncReport, Box<dyn std::error::Error>> {
    let pair = LoadedPair::open(sources)?;
    let mut options = ResyncOptions::new().with_dry_run(true);
    if let Some(filter) = filter {
        options = options.with_filter(parse_filter(&pair.schema, filter)?);
    }
    let report = pair.repo.resync_with(&pair.schema, &options)?;
    pair.repo.close()?;
    Ok(report)
}

/// Runs the verify command.
pub fn run(sources: &Sources, filter: Option<&str>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = compare(sources, filter)?;
    print_report(&report, format)?;

    if format != "json" {
        println!();
    }
    if report.is_clean() {
        if format != "json" {
            println!("✓ Replica matches master");
        }
        Ok(())
    } else {
        if format != "json" {
            println!("✗ Replica diverges from master");
        }
        Err(format!("{} divergent rows", report.divergent + report.corrupt_skipped).into())
    }
}
