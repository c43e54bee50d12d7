//! Observability metrics for request tracking.
//!
//! Metrics are recorded through the `metrics` crate facade; installing a
//! recorder (for example a Prometheus exporter) is left to the host process.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `vsnap_flow_requests_submitted_total` | Counter | `kind`, `result` | Request creates by outcome |
//! | `vsnap_flow_waits_total` | Counter | `kind`, `outcome` | Finished waits by outcome |
//! | `vsnap_flow_wait_duration_seconds` | Histogram | `kind`, `outcome` | Time from submit to verdict |
//! | `vsnap_flow_waits_in_flight` | Gauge | `kind` | Waits currently running |
//! | `vsnap_flow_observation_errors_total` | Counter | `source` | Failed watch or poll attempts |
//! | `vsnap_flow_aggregates_total` | Counter | `kind`, `outcome` | Aggregate verdicts |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vsnap_flow::metrics::FlowMetrics;
//! use vsnap_flow::phase::RequestKind;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_submission(RequestKind::Clone, "created");
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::phase::RequestKind;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Request creates by outcome.
    pub const REQUESTS_SUBMITTED_TOTAL: &str = "vsnap_flow_requests_submitted_total";
    /// Counter: Finished waits by outcome.
    pub const WAITS_TOTAL: &str = "vsnap_flow_waits_total";
    /// Histogram: Wait duration in seconds.
    pub const WAIT_DURATION_SECONDS: &str = "vsnap_flow_wait_duration_seconds";
    /// Gauge: Waits currently running.
    pub const WAITS_IN_FLIGHT: &str = "vsnap_flow_waits_in_flight";
    /// Counter: Failed watch or poll attempts.
    pub const OBSERVATION_ERRORS_TOTAL: &str = "vsnap_flow_observation_errors_total";
    /// Counter: Aggregate verdicts.
    pub const AGGREGATES_TOTAL: &str = "vsnap_flow_aggregates_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Request kind (clone, upload).
    pub const KIND: &str = "kind";
    /// Create result (created, already_exists, rejected).
    pub const RESULT: &str = "result";
    /// Verdict (completed, failed, timeout, deleted, ...).
    pub const OUTCOME: &str = "outcome";
    /// Observation channel (watch, poll).
    pub const SOURCE: &str = "source";
}

/// Running waits, one counter per request kind.
#[derive(Debug, Default)]
struct InFlight {
    clone: AtomicI64,
    upload: AtomicI64,
}

impl InFlight {
    const fn counter(&self, kind: RequestKind) -> &AtomicI64 {
        match kind {
            RequestKind::Clone => &self.clone,
            RequestKind::Upload => &self.upload,
        }
    }
}

/// High-level interface for recording request-tracking metrics.
///
/// Cheap to clone; clones share the in-flight counters.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    in_flight: Arc<InFlight>,
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of a create call.
    pub fn record_submission(&self, kind: RequestKind, result: &str) {
        counter!(
            names::REQUESTS_SUBMITTED_TOTAL,
            labels::KIND => kind.as_label(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a finished wait and its duration.
    pub fn record_wait(&self, kind: RequestKind, outcome: &str, elapsed: Duration) {
        counter!(
            names::WAITS_TOTAL,
            labels::KIND => kind.as_label(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            names::WAIT_DURATION_SECONDS,
            labels::KIND => kind.as_label(),
            labels::OUTCOME => outcome.to_string(),
        )
        .record(elapsed.as_secs_f64());
    }

    /// Records a failed watch or poll attempt.
    pub fn record_observation_error(&self, source: &str) {
        counter!(
            names::OBSERVATION_ERRORS_TOTAL,
            labels::SOURCE => source.to_string(),
        )
        .increment(1);
    }

    /// Records an aggregate verdict.
    pub fn record_aggregate(&self, kind: RequestKind, outcome: &str) {
        counter!(
            names::AGGREGATES_TOTAL,
            labels::KIND => kind.as_label(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Marks a wait as started; the returned guard marks it finished on drop.
    #[must_use]
    pub fn wait_started(&self, kind: RequestKind) -> InFlightGuard {
        let now = self.in_flight.counter(kind).fetch_add(1, Ordering::SeqCst) + 1;
        set_in_flight(kind, now);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            kind,
        }
    }

    /// Returns the number of waits of `kind` currently running.
    #[must_use]
    pub fn in_flight(&self, kind: RequestKind) -> i64 {
        self.in_flight.counter(kind).load(Ordering::SeqCst)
    }
}

#[allow(clippy::cast_precision_loss)] // Gauge values are small
fn set_in_flight(kind: RequestKind, value: i64) {
    gauge!(names::WAITS_IN_FLIGHT, labels::KIND => kind.as_label()).set(value as f64);
}

/// RAII guard decrementing the in-flight gauge.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
    kind: RequestKind,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.in_flight.counter(self.kind).fetch_sub(1, Ordering::SeqCst) - 1;
        set_in_flight(self.kind, now);
    }
}
