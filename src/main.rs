//! Accrual engine service.
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the order store, and runs the accrual engine until Ctrl+C or SIGTERM,
//! then drains claimed orders back to NEW before exiting.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use accrual_engine::config::AppConfig;
use accrual_engine::engine::rate_gate::RateGate;
use accrual_engine::engine::AccrualEngine;
use accrual_engine::oracle::HttpAccrualClient;
use accrual_engine::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::from_env()?;
    init_logging();

    info!(
        accrual_address = %cfg.accrual.address,
        database = %cfg.database.uri,
        workers = cfg.engine.worker_count,
        poll_interval_ms = cfg.engine.poll_interval_ms,
        "Accrual engine starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = SqliteStore::connect(&cfg.database.uri, cfg.database.max_connections)
        .await
        .with_context(|| format!("Failed to open order store at {}", cfg.database.uri))?;

    let gate = Arc::new(RateGate::new());
    let oracle = HttpAccrualClient::new(&cfg.accrual.address, Some(cfg.accrual_timeout()), cfg.accrual_retry())?
        .with_rate_gate(Arc::clone(&gate));

    let engine = AccrualEngine::new(Arc::new(store), Arc::new(oracle), cfg.engine_config()).with_rate_gate(gate);

    // -- Run until signalled ---------------------------------------------

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!("Entering main loop. Press Ctrl+C to stop.");
    let report = engine.run(cancel).await;

    info!(
        drained = report.drained,
        settled = report.stats.settled,
        claimed = report.stats.claimed,
        "Accrual engine exited."
    );
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    info!("Shutdown signal received.");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Initialise `tracing` with env-filter and optional JSON output.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("accrual_engine=info"));

    let json_logging = std::env::var("ACCRUAL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
