//! Prometheus metrics for the Checkly operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `checkly_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `checkly_reconcile_errors_total` (counter): reconcile errors labeled by controller and reason.
//! - `checkly_external_calls_total` (counter): Checkly API calls labeled by kind, operation and outcome.
//! - `checkly_derived_checks` (gauge): ApiChecks currently derived from Ingress annotations.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::checkly::ApiError;
use crate::crd::ResourceKind;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "apicheck"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error reason, e.g. "Transient", "InvalidSpec"
    pub reason: String,
}

/// Labels for calls made against the Checkly API
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExternalCallLabels {
    pub kind: String,
    /// "create", "read", "update" or "delete"
    pub operation: String,
    /// "ok" or the error reason
    pub outcome: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking Checkly API calls
pub static EXTERNAL_CALLS_TOTAL: Lazy<Family<ExternalCallLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking annotation-derived ApiChecks
pub static DERIVED_CHECKS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "checkly_reconcile_duration_seconds",
        "Duration of reconcile invocations in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "checkly_reconcile_errors_total",
        "Total number of failed reconcile invocations",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "checkly_external_calls_total",
        "Total number of calls made to the Checkly API",
        EXTERNAL_CALLS_TOTAL.clone(),
    );
    registry.register(
        "checkly_derived_checks",
        "Number of ApiChecks derived from Ingress annotations",
        DERIVED_CHECKS.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, reason: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        reason: reason.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Count one Checkly API call and its outcome.
pub fn observe_external_call(kind: ResourceKind, operation: &str, error: Option<&ApiError>) {
    let labels = ExternalCallLabels {
        kind: kind.to_string(),
        operation: operation.to_string(),
        outcome: error.map_or("ok", ApiError::reason).to_string(),
    };
    EXTERNAL_CALLS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_derived_checks(count: i64) {
    DERIVED_CHECKS.set(count);
}

/// Render the registry in the Prometheus text format.
pub fn encode_text() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
