//! Metrics collection and exposition.
//!
//! # Metrics
//! - `wallet_submissions_total` (counter): transfers by provider kind and outcome
//! - `wallet_submission_retries_total` (counter): retried attempts by reason
//! - `wallet_status_transitions_total` (counter): record transitions by status
//! - `wallet_nonces_in_flight` (gauge): reserved-but-uncommitted nonces per wallet
//! - `wallet_spending_rejections_total` (counter): transfers refused by a cap
//! - `wallet_confirmation_seconds` (histogram): submit-to-terminal latency
//! - `wallet_active_watchers` (gauge): running confirmation watchers
//! - `wallet_rpc_health` (gauge): 1=healthy, 0=unhealthy per chain

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

use crate::chain::types::ChainId;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_submission(kind: &str, outcome: &'static str) {
    counter!("wallet_submissions_total", "kind" => kind.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_retry(reason: &'static str) {
    counter!("wallet_submission_retries_total", "reason" => reason).increment(1);
}

pub fn record_status_transition(status: &'static str) {
    counter!("wallet_status_transitions_total", "status" => status).increment(1);
}

pub fn record_nonces_in_flight(wallet: &str, chain: ChainId, count: usize) {
    gauge!(
        "wallet_nonces_in_flight",
        "wallet" => wallet.to_string(),
        "chain" => chain.to_string()
    )
    .set(count as f64);
}

pub fn record_spending_rejected(wallet: &str, token: &str) {
    counter!(
        "wallet_spending_rejections_total",
        "wallet" => wallet.to_string(),
        "token" => token.to_string()
    )
    .increment(1);
}

pub fn record_confirmation_latency(status: &'static str, start: Instant) {
    histogram!("wallet_confirmation_seconds", "status" => status)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_active_watchers(count: usize) {
    gauge!("wallet_active_watchers").set(count as f64);
}

pub fn record_rpc_health(chain: ChainId, healthy: bool) {
    gauge!("wallet_rpc_health", "chain" => chain.to_string()).set(if healthy { 1.0 } else { 0.0 });
}
