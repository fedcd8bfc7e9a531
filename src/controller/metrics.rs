//! Prometheus metrics for the KubeDB operator
//!
//! # Exported metrics
//! The `/metrics` endpoint exports the following metrics:
//! - `kubedb_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `kubedb_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `kubedb_queue_depth` (gauge): keys waiting in a work queue, labeled by queue.
//! - `kubedb_queue_retries_total` (counter): rate-limited requeues labeled by queue.
//! - `kubedb_retries_exhausted_total` (counter): keys that hit the requeue cap, labeled by queue.
//! - `kubedb_convergence_total` (counter): create-or-patch outcomes labeled by child kind and outcome.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "redis"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category, e.g. "kube", "conflict", "wait_timeout"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConvergenceLabels {
    /// Child kind, e.g. "Service"
    pub kind: String,
    /// "created", "patched" or "unchanged"
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

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static QUEUE_RETRIES_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RETRIES_EXHAUSTED_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CONVERGENCE_TOTAL: Lazy<Family<ConvergenceLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "kubedb_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "kubedb_reconcile_errors_total",
        "Total number of failed reconcile passes",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "kubedb_queue_depth",
        "Keys waiting in the work queue",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "kubedb_queue_retries_total",
        "Rate-limited requeues",
        QUEUE_RETRIES_TOTAL.clone(),
    );
    registry.register(
        "kubedb_retries_exhausted_total",
        "Keys that reached the requeue cap",
        RETRIES_EXHAUSTED_TOTAL.clone(),
    );
    registry.register(
        "kubedb_convergence_total",
        "Outcomes of child resource convergence",
        CONVERGENCE_TOTAL.clone(),
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
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_DEPTH
        .get_or_create(&labels)
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn inc_queue_retries(queue: &str) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_RETRIES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_retries_exhausted(queue: &str) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    RETRIES_EXHAUSTED_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_convergence(kind: &str, outcome: &str) {
    let labels = ConvergenceLabels {
        kind: kind.to_string(),
        outcome: outcome.to_string(),
    };
    CONVERGENCE_TOTAL.get_or_create(&labels).inc();
}
