//! Observation spooler - store-and-forward delivery to a SensorThings API
//!
//! This service samples environmental sensors on a fixed interval, spools
//! every reading into a local SQLite database, and delivers batches to a
//! remote SensorThings endpoint, reconciling per-row outcomes so nothing
//! is lost or duplicated across crashes and outages.
//!
//! ## Features
//!
//! - Durable spool decoupling sampling from delivery
//! - Batched `CreateObservations` submission with per-row reconciliation
//! - TTL-cached bearer-token authentication
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables (see the config
//! module for the full list):
//!
//! - `OBS_SPOOLER_DB_PATH`: spool database path (default: observations.sqlite3)
//! - `OBS_SPOOLER_BASE_URL`: SensorThings API base URL (default: http://localhost:8080)
//! - `OBS_SPOOLER_AUTH_URL`: login endpoint URL (required)
//! - `OBS_SPOOLER_CLIENT_ID` / `OBS_SPOOLER_CLIENT_KEY`: login credentials (required)
//! - `OBS_SPOOLER_SAMPLE_INTERVAL_SECS`: seconds between samples (default: 60)
//! - `OBS_SPOOLER_TRANSMIT_INTERVAL_SECS`: seconds between delivery cycles (default: 15)
//! - `OBS_SPOOLER_BATCH_LIMIT`: observations per delivery cycle (default: 360)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! ## Maintenance
//!
//! `obs-spooler reset-errors` returns every ERROR observation to PENDING
//! so the next delivery cycle resubmits it, prints the affected row count,
//! and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use obs_spooler::auth::Authenticator;
use obs_spooler::batch::Batcher;
use obs_spooler::client::StaClient;
use obs_spooler::config::Config;
use obs_spooler::sampler::{build_sensors, sampler_task};
use obs_spooler::spool::spool_task;
use obs_spooler::store::{ObservationStore, StoreError};
use obs_spooler::transmit::Transmitter;

/// Channel capacity between the sampler and the spool writer
const CHANNEL_CAPACITY: usize = 1000;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    // Maintenance subcommands bypass the service startup
    if let Some(command) = std::env::args().nth(1) {
        run_command(&command);
        return;
    }

    info!("Starting observation spooler...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                create_url = %config.create_url,
                db_path = %config.db_path,
                sample_interval_secs = config.sample_interval.as_secs(),
                transmit_interval_secs = config.transmit_interval.as_secs(),
                batch_limit = config.batch_limit,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Open the spool database
    let store = match ObservationStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, db_path = %config.db_path, "Failed to open spool database");
            std::process::exit(1);
        }
    };

    match store.count_pending() {
        Ok(0) => {}
        Ok(backlog) => info!(backlog = backlog, "Undelivered observations in spool"),
        Err(e) => warn!(error = %e, "Could not count spool backlog"),
    }

    // Create HTTP client with connection pooling
    let client = match StaClient::new(&config) {
        Ok(client) => {
            info!(create_url = %client.create_url(), "HTTP client initialized");
            client
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let authenticator = Authenticator::from_config(&config);
    let batcher = Batcher::from_config(&config);
    let sensors = build_sensors(&config);

    // Channel for sampled observations
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    // Shutdown signal for the transmitter
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn spool writer task - appends sampled observations to the store
    let spool_handle = tokio::spawn(spool_task(rx, Arc::clone(&store)));

    // Spawn sampler task - produces readings at regular intervals
    let sampler_handle = tokio::spawn(sampler_task(sensors, config.sample_interval, tx.clone()));

    // Spawn transmitter task - drives delivery cycles
    let transmitter = Transmitter::new(
        Arc::clone(&store),
        client,
        authenticator,
        batcher,
        &config,
    );
    let transmit_handle = tokio::spawn(transmitter.run(shutdown_rx));

    // Wait for shutdown signal
    info!("Observation spooler running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");

    // Stop producing: abort the sampler and close the spool channel
    sampler_handle.abort();
    drop(tx);

    // Let an in-flight delivery cycle finish before the transmitter stops
    if shutdown_tx.send(true).is_err() {
        warn!("Transmitter already stopped");
    }

    let shutdown_timeout = config.request_timeout + Duration::from_secs(5);

    match tokio::time::timeout(shutdown_timeout, spool_handle).await {
        Ok(Ok(appended)) => {
            info!(appended = appended, "Spool writer shut down gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Spool writer panicked during shutdown");
        }
        Err(_) => {
            warn!("Spool writer shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    match tokio::time::timeout(shutdown_timeout, transmit_handle).await {
        Ok(Ok(())) => {
            info!("Transmitter shut down gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Transmitter panicked during shutdown");
        }
        Err(_) => {
            warn!("Transmitter shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    info!("Observation spooler stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Handle a maintenance subcommand.
///
/// Maintenance operates on the local spool only and deliberately skips
/// `Config::from_env`, so it runs without the delivery credentials.
fn run_command(command: &str) {
    match command {
        "reset-errors" => {
            let db_path = Config::db_path_from_env();
            match reset_errors(&db_path) {
                Ok(count) => {
                    info!(
                        db_path = %db_path,
                        reset = count,
                        "ERROR observations returned to PENDING"
                    );
                    println!("{}", count);
                }
                Err(e) => {
                    error!(error = %e, db_path = %db_path, "Failed to reset ERROR observations");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Usage: obs-spooler [reset-errors]");
            std::process::exit(2);
        }
    }
}

fn reset_errors(db_path: &str) -> Result<usize, StoreError> {
    let store = ObservationStore::open(db_path)?;
    store.reset_errors()
}
