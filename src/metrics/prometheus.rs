//! Prometheus metrics definitions and text exposition

use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

use anyhow::Context;

lazy_static::lazy_static! {
    /// Total number of workload operations started
    pub static ref OPERATIONS: CounterVec = register_counter_vec!(
        "workload_operations_total",
        "Total number of workload operations",
        &["operation"]
    ).unwrap();

    /// Total number of workload operations that returned an error
    pub static ref OPERATION_ERRORS: CounterVec = register_counter_vec!(
        "workload_operation_errors_total",
        "Total number of failed workload operations",
        &["operation"]
    ).unwrap();

    /// Writes retried after an optimistic-concurrency conflict
    pub static ref CONFLICT_RETRIES: CounterVec = register_counter_vec!(
        "workload_conflict_retries_total",
        "Total number of writes retried after a version conflict",
        &["operation"]
    ).unwrap();

    /// Operation duration histogram
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "workload_operation_duration_seconds",
        "Duration of workload operations in seconds",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Status reads that returned a degraded view
    pub static ref DEGRADED_STATUS: CounterVec = register_counter_vec!(
        "workload_degraded_status_total",
        "Total number of status reads degraded by a failing source",
        &["reason"]
    ).unwrap();
}

/// Render all registered metrics in the Prometheus text format
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;

    String::from_utf8(buffer).context("Metrics are not valid UTF-8")
}
