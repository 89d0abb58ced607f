use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref RUNS_DETECTED: IntCounter = register_int_counter_with_registry!(
        "sentinel_runs_detected_total",
        "Runs newly observed by the detector.",
        REGISTRY
    )
    .unwrap();
    pub static ref RUNS_FINALIZED: IntCounterVec = register_int_counter_vec_with_registry!(
        "sentinel_runs_finalized_total",
        "Runs moved to a terminal state.",
        &["state"],
        REGISTRY
    )
    .unwrap();
    pub static ref ACTIVE_RUNS: IntGauge = register_int_gauge_with_registry!(
        "sentinel_active_runs",
        "Runs currently being monitored.",
        REGISTRY
    )
    .unwrap();
    pub static ref LOG_LINES_STREAMED: IntCounter = register_int_counter_with_registry!(
        "sentinel_log_lines_streamed_total",
        "Log lines read from all sources.",
        REGISTRY
    )
    .unwrap();
    pub static ref LOG_LINES_DROPPED: IntCounter = register_int_counter_with_registry!(
        "sentinel_log_lines_dropped_total",
        "Log lines evicted from a full buffer.",
        REGISTRY
    )
    .unwrap();
    pub static ref LOG_SOURCES_LOST: IntCounter = register_int_counter_with_registry!(
        "sentinel_log_sources_lost_total",
        "Log sources given up on after exhausting reconnects.",
        REGISTRY
    )
    .unwrap();
    pub static ref POD_EVENTS_OBSERVED: IntCounter = register_int_counter_with_registry!(
        "sentinel_pod_events_total",
        "Pod events emitted by the watcher, synthetic ones included.",
        REGISTRY
    )
    .unwrap();
    pub static ref WATCH_RESYNCS: IntCounter = register_int_counter_with_registry!(
        "sentinel_watch_resyncs_total",
        "List-and-diff resynchronisations after a watch gap.",
        REGISTRY
    )
    .unwrap();
    pub static ref ANOMALIES_RAISED: IntCounterVec = register_int_counter_vec_with_registry!(
        "sentinel_anomalies_total",
        "Anomalies opened; repeats of an open anomaly are not counted.",
        &["kind"],
        REGISTRY
    )
    .unwrap();
    pub static ref ALERTS_SENT: IntCounter = register_int_counter_with_registry!(
        "sentinel_alerts_sent_total",
        "Alerts delivered to a channel.",
        REGISTRY
    )
    .unwrap();
    pub static ref ALERTS_SUPPRESSED: IntCounter = register_int_counter_with_registry!(
        "sentinel_alerts_suppressed_total",
        "Dispatches skipped because the condition was already alerted.",
        REGISTRY
    )
    .unwrap();
    pub static ref ALERTS_FAILED: IntCounter = register_int_counter_with_registry!(
        "sentinel_alerts_failed_total",
        "Alerts marked FAILED after exhausting retries.",
        REGISTRY
    )
    .unwrap();
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
}
