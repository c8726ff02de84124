//! Transfer Orchestrator - HTTP service for balances, fee estimation and transfers
//!
//! Serves the transfer API for every configured chain and, optionally,
//! Prometheus metrics.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use transfer_orchestrator::api::{self, AppState};
use transfer_orchestrator::config::{LoggingConfig, Settings};
use transfer_orchestrator::metrics::MetricsServer;
use transfer_orchestrator::{ChainRegistry, FeeEstimator, LocalNonceCoordinator, TransferSubmitter};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!("Starting Transfer Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize chain clients
    let registry = Arc::new(ChainRegistry::from_settings(&settings)?);
    info!("Chain clients initialized");

    // Initialize the submission pipeline
    let coordinator = Arc::new(LocalNonceCoordinator::new(settings.nonce.lease_timeout()));
    let fees = FeeEstimator::new(settings.fees.clone(), settings.rpc.request_timeout())?;
    let submitter = Arc::new(TransferSubmitter::new(
        coordinator,
        fees,
        settings.receipts.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            registry: registry.clone(),
            submitter,
            shutdown: shutdown.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let registry = registry.clone();
        async move {
            loop {
                for (chain_id, block) in registry.health_check().await {
                    if block.is_none() {
                        warn!("Chain {} is not answering", chain_id);
                    }
                }
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
            }
        }
    });

    info!("Transfer Orchestrator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight submissions release their leases on cancellation
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!("API server task ended abnormally: {}", e);
    }

    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Transfer Orchestrator stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,transfer_orchestrator=debug,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
