//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain reachability
//! - Transfer submission outcomes
//! - Nonce lease lifecycle
//! - Estimation failures and receipt latency

use crate::error::{TransferError, TransferResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_REACHABLE: GaugeVec = register_gauge_vec!(
        "transfer_chain_reachable",
        "RPC endpoint status (1=answering, 0=not answering)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "transfer_chain_block_height",
        "Last block height seen per chain",
        &["chain_id"]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFERS_SUBMITTED: CounterVec = register_counter_vec!(
        "transfer_submitted_total",
        "Transfers broadcast",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "transfer_failed_total",
        "Transfers that failed, by error kind",
        &["chain_id", "kind", "error"]
    ).unwrap();

    pub static ref RECEIPT_LATENCY: HistogramVec = register_histogram_vec!(
        "transfer_receipt_latency_seconds",
        "Time from broadcast until the receipt was observed",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref ESTIMATION_FAILURES: CounterVec = register_counter_vec!(
        "transfer_estimation_failures_total",
        "Gas estimation and gas price failures",
        &["kind"]
    ).unwrap();

    // Nonce metrics
    pub static ref LEASES_ACQUIRED: Counter = register_counter!(
        "transfer_nonce_leases_acquired_total",
        "Nonce leases handed out"
    ).unwrap();

    pub static ref LEASES_COMMITTED: Counter = register_counter!(
        "transfer_nonce_leases_committed_total",
        "Nonce leases consumed by a broadcast"
    ).unwrap();

    pub static ref LEASES_RELEASED: Counter = register_counter!(
        "transfer_nonce_leases_released_total",
        "Nonce leases returned unused"
    ).unwrap();

    pub static ref LEASES_RECLAIMED: Counter = register_counter!(
        "transfer_nonce_leases_reclaimed_total",
        "Abandoned nonce leases reclaimed after timeout"
    ).unwrap();

    pub static ref LEASE_WAIT: Histogram = register_histogram!(
        "transfer_nonce_lease_wait_seconds",
        "Time spent waiting for a nonce lease",
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TransferResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TransferError::Config(format!("cannot bind metrics port {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TransferError::Config(format!("metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, block: Option<u64>) {
    let label = chain_id.to_string();
    CHAIN_REACHABLE
        .with_label_values(&[&label])
        .set(if block.is_some() { 1.0 } else { 0.0 });
    if let Some(block) = block {
        CHAIN_BLOCK_HEIGHT.with_label_values(&[&label]).set(block as f64);
    }
}

pub fn record_transfer_submitted(chain_id: u64, kind: &str) {
    TRANSFERS_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_transfer_failed(chain_id: u64, kind: &str, error: &str) {
    TRANSFERS_FAILED
        .with_label_values(&[&chain_id.to_string(), kind, error])
        .inc();
}

pub fn record_receipt_latency(chain_id: u64, latency_secs: f64) {
    RECEIPT_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_estimation_failure(kind: &str) {
    ESTIMATION_FAILURES.with_label_values(&[kind]).inc();
}

pub fn record_lease_acquired(wait_secs: f64) {
    LEASES_ACQUIRED.inc();
    LEASE_WAIT.observe(wait_secs);
}

pub fn record_lease_committed() {
    LEASES_COMMITTED.inc();
}

pub fn record_lease_released() {
    LEASES_RELEASED.inc();
}

pub fn record_lease_reclaimed() {
    LEASES_RECLAIMED.inc();
}
