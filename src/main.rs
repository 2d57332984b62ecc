// main.rs

mod cli;
mod error;
mod join;
mod loader;
mod matrix;
mod output;
mod pipeline;
mod plots;
mod ppca;
mod summary;

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use log::{error, info};
use std::time::Instant;

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting scmet_pca with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Load, join, summarise and reduce each annotation class ---
    let config = pipeline::PipelineConfig::from_cli(&cli_args);
    let report = pipeline::run(&config)?;

    // --- 2. Report ---
    if report.branches.is_empty() {
        return Err(anyhow!(
            "No annotation classes to analyse. Check --annotations against the input."
        ));
    }
    for branch in report.branches.iter().filter(|b| b.is_ok()) {
        info!(
            "'{}': {} samples x {} features, explained variance {:?}",
            branch.annotation,
            branch.n_samples.unwrap_or(0),
            branch.n_features.unwrap_or(0),
            branch.explained_variance
        );
    }
    if report.n_failed() == report.branches.len() {
        for branch in &report.branches {
            error!(
                "'{}': {}",
                branch.annotation,
                branch.error.as_deref().unwrap_or("unknown error")
            );
        }
        return Err(anyhow!(
            "Every annotation analysis failed. See errors above."
        ));
    }

    info!(
        "scmet_pca finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}
