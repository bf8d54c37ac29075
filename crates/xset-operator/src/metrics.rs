//! Metrics for the XSet engine
//!
//! OpenTelemetry instruments for the reconcile loop: duration, error
//! counts, and the expectation gate's requeue count.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("xset"));

/// Histogram of reconcile duration
///
/// Labels:
/// - `xset`: namespace/name of the parent
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("xset_reconcile_duration_seconds")
        .with_description("Duration of XSet reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `xset`: namespace/name of the parent
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("xset_reconcile_errors_total")
        .with_description("Total number of XSet reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of reconciles short-circuited by unsatisfied expectations
///
/// Labels:
/// - `xset`: namespace/name of the parent
pub static EXPECTATION_REQUEUES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("xset_expectation_requeues_total")
        .with_description("Reconciles requeued while waiting for the cache to catch up")
        .with_unit("{requeues}")
        .build()
});

/// Record a reconciliation with timing
pub struct ReconcileTimer {
    xset: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(xset: impl Into<String>) -> Self {
        Self {
            xset: xset.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("xset", self.xset),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("xset", self.xset.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("xset", self.xset),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

/// Record an expectation-gated requeue
pub fn record_expectation_requeue(xset: &str) {
    EXPECTATION_REQUEUES.add(1, &[KeyValue::new("xset", xset.to_string())]);
}
