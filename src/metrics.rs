//! Prometheus metrics
//!
//! - Allocations by selection policy
//! - Completions by outcome
//! - Operation latency
//! - Pending transactions, unsettled decrements and storage health

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref ALLOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("slotkeeper_allocations_total", "Folders handed out"),
        &["policy"]
    ).unwrap();

    pub static ref COMPLETIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("slotkeeper_completions_total", "Completion requests by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "slotkeeper_operation_duration_seconds",
            "Allocate/complete duration in seconds, lock wait included"
        ).buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["operation"]
    ).unwrap();

    pub static ref PENDING_TRANSACTIONS: IntGauge = IntGauge::new(
        "slotkeeper_pending_transactions",
        "Allocations without a completion"
    ).unwrap();

    pub static ref UNSETTLED_DECREMENTS: IntGauge = IntGauge::new(
        "slotkeeper_unsettled_decrements",
        "Logged completions whose counter decrement is not yet applied"
    ).unwrap();

    pub static ref STORAGE_DEGRADED: IntGauge = IntGauge::new(
        "slotkeeper_storage_degraded",
        "1 while reads are served from a missing or corrupt file"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(ALLOCATIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(COMPLETIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(OPERATION_DURATION.clone())).ok();
    METRICS_REGISTRY.register(Box::new(PENDING_TRANSACTIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(UNSETTLED_DECREMENTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(STORAGE_DEGRADED.clone())).ok();
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

pub fn observe_operation(operation: &str, started: Instant) {
    OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());
}

pub fn set_storage_degraded(degraded: bool) {
    STORAGE_DEGRADED.set(i64::from(degraded));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        init_metrics();
        ALLOCATIONS_TOTAL.with_label_values(&["fresh"]).inc();

        let text = export_metrics();
        assert!(text.contains("slotkeeper_allocations_total"));
    }
}
