//! Prometheus metrics for the patch log cluster.
//!
//! Metrics cover:
//! - Leader elections and datasets led by this process
//! - Append throughput by path (local or forwarded) and outcome (`success` or
//!   the error's metric label)
//! - Forwarded reads and writes by operation
//! - Reconciliation rounds, peer failures and patches applied
//! - Coordination session events and head publication failures
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "patchlog" prefix to avoid
//! name collisions with other libraries using the default Prometheus registry.
//! Registration errors are handled gracefully - if a metric fails to register,
//! an unregistered metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

use super::error::ClusterError;

/// Custom Prometheus registry for patch log metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("patchlog".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Leadership
// =============================================================================

define_counter_vec!(
    LEADER_ELECTIONS,
    "leader_elections_total",
    "Leader election attempts by result",
    ["result"]
);
define_gauge!(
    DATASETS_LED,
    "datasets_led",
    "Number of datasets this process currently leads"
);
define_counter!(
    LEADERSHIP_NOTIFICATIONS,
    "leadership_notifications_total",
    "Leadership changes delivered to watch callbacks"
);

// =============================================================================
// Requests
// =============================================================================

define_counter_vec!(
    APPENDS,
    "appends_total",
    "Append requests by path and status",
    ["path", "status"]
);
define_counter_vec!(
    FORWARDED_REQUESTS,
    "forwarded_requests_total",
    "Requests forwarded to a dataset leader by operation and status",
    ["operation", "status"]
);
define_counter!(
    HEAD_PUBLISH_FAILURES,
    "head_publish_failures_total",
    "Local appends whose new head could not be published"
);
define_counter!(
    PATCH_CACHE_FAILURES,
    "patch_cache_failures_total",
    "Patches fetched from a leader that could not be cached locally"
);

// =============================================================================
// Reconciliation
// =============================================================================

define_counter!(
    SYNC_ROUNDS,
    "sync_rounds_total",
    "Completed reconciliation rounds"
);
define_counter!(
    SYNC_PEER_FAILURES,
    "sync_peer_failures_total",
    "Peers that failed during reconciliation"
);
define_counter!(
    SYNC_PATCHES_APPLIED,
    "sync_patches_applied_total",
    "Patches appended locally by reconciliation"
);
define_counter!(
    SYNC_DATASETS_CREATED,
    "sync_datasets_created_total",
    "Datasets created locally after being discovered on a peer"
);
define_histogram_vec!(
    SYNC_DURATION,
    "sync_duration_seconds",
    "Duration of reconciliation rounds",
    ["result"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
);

// =============================================================================
// Coordination
// =============================================================================

define_counter_vec!(
    SESSION_EVENTS,
    "session_events_total",
    "Coordination session events by kind",
    ["event"]
);
define_gauge!(
    SESSION_LOST,
    "session_lost",
    "Whether the coordination session is currently lost (1 = lost)"
);
define_counter_vec!(
    COORDINATION_FAILURES,
    "coordination_failures_total",
    "Failed coordination service calls by operation",
    ["operation"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Registration helpers
// =============================================================================

/// Register an IntGauge safely, returning an unregistered gauge on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning an unregistered counter on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning an unregistered counter on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning an unregistered histogram on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

/// `success`, or the failed request's error label.
fn status_label(error: Option<&ClusterError>) -> &'static str {
    error.map_or("success", ClusterError::as_metric_label)
}

/// Record the result of one `try_become_leader` call.
pub fn record_election(won: bool) {
    let result = if won { "won" } else { "lost" };
    LEADER_ELECTIONS.with_label_values(&[result]).inc();
}

pub fn set_datasets_led(count: usize) {
    DATASETS_LED.set(count as i64);
}

/// Record an append served locally (`forwarded = false`) or by the leader.
pub fn record_append(forwarded: bool, error: Option<&ClusterError>) {
    let path = if forwarded { "forwarded" } else { "local" };
    APPENDS
        .with_label_values(&[path, status_label(error)])
        .inc();
}

pub fn record_forward(operation: &str, error: Option<&ClusterError>) {
    FORWARDED_REQUESTS
        .with_label_values(&[operation, status_label(error)])
        .inc();
}

/// Record a finished reconciliation round.
pub fn record_sync_round(duration_secs: f64, peers_failed: usize, patches_applied: usize) {
    SYNC_ROUNDS.inc();
    SYNC_PEER_FAILURES.inc_by(peers_failed as u64);
    SYNC_PATCHES_APPLIED.inc_by(patches_applied as u64);
    let result = if peers_failed == 0 { "complete" } else { "partial" };
    SYNC_DURATION
        .with_label_values(&[result])
        .observe(duration_secs);
}

pub fn record_session_event(event: &str) {
    SESSION_EVENTS.with_label_values(&[event]).inc();
}

pub fn record_coordination_failure(operation: &str) {
    COORDINATION_FAILURES.with_label_values(&[operation]).inc();
}
