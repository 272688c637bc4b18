//! Prometheus metrics for the AppService operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `appservice_reconcile_duration_seconds` (histogram): duration of reconcile passes.
//! - `appservice_reconcile_errors_total` (counter): failed passes labeled by error kind.
//! - `appservice_reconcile_outcomes_total` (counter): successful passes labeled by outcome.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error kind, e.g. "kube", "conflict", "malformed_snapshot"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    // 1ms .. ~32s across 16 buckets.
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking successful reconcile passes
pub static RECONCILE_OUTCOMES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "appservice_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );

    // Counters get their `_total` suffix from the encoder.
    registry.register(
        "appservice_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry.register(
        "appservice_reconcile_outcomes",
        "Total number of successful reconcile passes by outcome",
        RECONCILE_OUTCOMES_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(seconds: f64) {
    RECONCILE_DURATION_SECONDS.observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_reconcile_outcome(outcome: &str) {
    let labels = OutcomeLabels {
        outcome: outcome.to_string(),
    };
    RECONCILE_OUTCOMES_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the Prometheus text exposition format
pub fn render() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &REGISTRY) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    buffer
}
