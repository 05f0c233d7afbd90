//! efs-purger - High-Throughput Bulk File Purger
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use efs_purger::config::{CliArgs, PurgeConfig};
use efs_purger::coordinator::PurgeCoordinator;
use efs_purger::logging::setup_logging;
use efs_purger::stats::Phase;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::error;

/// Exit status for a run aborted by the memory circuit breaker
const EXIT_ABORTED: u8 = 2;
/// Exit status for an operator interrupt
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    setup_logging(args.log_level);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: CliArgs) -> Result<ExitCode> {
    let config = PurgeConfig::from_args(args, SystemTime::now())?;

    // The listing pool bounds how many blocking native readdir calls run at
    // once; sized from the subdir slots so listings never become the
    // bottleneck behind a wide walk
    let listing_pool = config.listing_pool_size();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .max_blocking_threads(listing_pool)
        .build()
        .context("Failed to create tokio runtime")?;

    let coordinator = PurgeCoordinator::new(config);

    // First interrupt stops scheduling new work and lets the run drain;
    // a second one force-exits
    let flags = coordinator.flags();
    let interrupts = Arc::new(AtomicU32::new(0));
    let interrupts_handler = Arc::clone(&interrupts);
    ctrlc::set_handler(move || {
        let count = interrupts_handler.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            eprintln!("\nInterrupt received, shutting down gracefully...");
            eprintln!("Press Ctrl+C again to force exit immediately.");
            flags.request_shutdown();
        } else {
            eprintln!("\nForced exit!");
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    })
    .context("Failed to set signal handler")?;

    let report = runtime.block_on(coordinator.purge())?;

    if interrupts.load(Ordering::SeqCst) > 0 {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if report.phase == Phase::Aborted {
        return Ok(ExitCode::from(EXIT_ABORTED));
    }
    Ok(ExitCode::SUCCESS)
}
