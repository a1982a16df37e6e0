//! Metrics definitions for the SFU service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, sessions, session)
//! - `outcome`: 2 values (exited, crashed)
//! - `method`: bounded by signaling methods (~7 values)
//! - `status`: `ok` or an error code (~7 values)
//! - `operation`: bounded by engine calls (~8 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Engine calls are in-process or local IPC
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_engine".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Source & Session Metrics (Gauges)
// ============================================================================

/// Set the number of registered sources.
///
/// Metric: `sfu_sources_active`
pub fn set_sources_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_sources_active").set(count as f64);
}

/// Set the number of connected viewer sessions.
///
/// Metric: `sfu_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_sessions_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Encoder Metrics (Counters)
// ============================================================================

/// Record an encoder termination.
///
/// Metric: `sfu_encoder_exits_total`
/// Labels: `outcome` (exited, crashed)
pub fn record_encoder_exit(outcome: &str) {
    counter!("sfu_encoder_exits_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record an encoder restart scheduled by the restart policy.
///
/// Metric: `sfu_encoder_restarts_total`
pub fn record_encoder_restart() {
    counter!("sfu_encoder_restarts_total").increment(1);
}

// ============================================================================
// Consumption Metrics
// ============================================================================

/// Record a consumption handle created for a viewer.
///
/// Metric: `sfu_consumers_created_total`
pub fn record_consumer_created() {
    counter!("sfu_consumers_created_total").increment(1);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record a media engine call.
///
/// Metric: `sfu_engine_call_duration_seconds`
/// Labels: `operation`
pub fn record_engine_call(operation: &str, duration: Duration) {
    histogram!("sfu_engine_call_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a handled signaling request.
///
/// Metrics: `sfu_signaling_requests_total` (labels `method`, `status`),
/// `sfu_signaling_request_duration_seconds` (label `method`)
pub fn record_signaling_request(method: &str, status: &str, duration: Duration) {
    counter!("sfu_signaling_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!("sfu_signaling_request_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Additional Operational Metrics
// ============================================================================

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
