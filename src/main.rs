//! # Pub/Sub Load Test Driver - Main Entry Point
//!
//! Parses the command line, validates the run configuration, drives the units
//! through a [`Controller`] and reports latency percentiles per client type.
//!
//! ## Execution Flow
//!
//! 1. **Parse arguments**: clap rejects malformed and non-positive values
//! 2. **Initialize logging**: console and optional file output
//! 3. **Build configuration**: cross-checks flags before anything starts
//! 4. **Run**: initialize, start clients, await results
//! 5. **Report**: log and print percentiles, optionally write JSON
//! 6. **Shut down**: always, passing the error that ended the run if any
//!
//! ## Error Handling
//!
//! Any failure is logged with its full context chain and the process exits
//! with status 1. Nothing is retried.

use anyhow::{Context, Result};
use clap::Parser;
use pubsub_loadtest::{
    cli::Args,
    config::LoadtestConfig,
    controller::{run_to_completion, LocalController},
    logging::init_logging,
    results::ResultsManager,
    AggregatedHistogram, ClientType,
};
use std::collections::BTreeMap;
use std::process::ExitCode;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Held until return so buffered file output is flushed.
    let _log_guard = match init_logging(args.verbose, args.quiet, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Loadtest failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run one load test from parsed arguments
async fn run(args: &Args) -> Result<()> {
    info!("Starting Pub/Sub load test");
    debug!("Arguments: {:?}", args);

    // Fail before any unit is started.
    let config = LoadtestConfig::from_args(args).context("invalid configuration")?;
    let mut results_manager = ResultsManager::new(args.output_file.as_deref());
    info!("Run id: {}", results_manager.run_id());

    let mut controller = LocalController::new(config.clone());
    run_to_completion(&mut controller, |groups| {
        report(&mut results_manager, groups, &config, args.quiet)
    })
    .await
}

/// Log, print and save the merged results
fn report(
    results_manager: &mut ResultsManager,
    groups: &BTreeMap<ClientType, AggregatedHistogram>,
    config: &LoadtestConfig,
    quiet: bool,
) -> Result<()> {
    results_manager.add_results(groups, &config.percentiles)?;
    results_manager.log_results();
    if !quiet {
        results_manager.print_summary();
    }
    results_manager.finalize(config)?;
    Ok(())
}
