//! Reduce the progress of many requests to one verdict.
//!
//! [`CompletionAggregator::await_all`] watches every request of a kind in one
//! namespace (optionally narrowed by labels) and returns as soon as the
//! outcome is decided:
//!
//! - N distinct objects observed `Completed`: success
//! - any object observed `Failed` or `FailedValidation`: failure with that
//!   object's message, without waiting for the rest
//! - an object deleted before reaching a terminal phase: failure (a deletion
//!   that carries the terminal phase counts as that phase)
//! - the deadline: failure stating how many of N completed
//!
//! Scope aggregations per backup with an owner label; without one, requests
//! belonging to concurrent backups are counted together.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use vsnap_core::ObjectUid;
use vsnap_core::observability::aggregate_span;

use crate::config::ObservationConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::observe::{Observation, ObservationSource, PollTarget};
use crate::phase::{Phase, PhaseTracker, RequestKind, Transition};
use crate::request::{AggregateFailure, AggregateOutcome, FailureCause, RequestObject};
use crate::store::{RequestStore, WatchScope};

enum Step {
    Cancelled,
    Deadline,
    Observed(Result<Observation>),
}

/// Per-call tally of observed requests.
#[derive(Debug, Default)]
struct Tally {
    trackers: HashMap<ObjectUid, PhaseTracker>,
    succeeded: HashSet<ObjectUid>,
}

impl Tally {
    /// Applies one observation; returns the failure that ends the wait, if any.
    fn apply(&mut self, observation: Observation) -> Result<Option<AggregateFailure>> {
        match observation {
            Observation::Current(object) => self.apply_current(&object),
            Observation::Deleted(object) => self.apply_deleted(&object),
        }
    }

    fn apply_current(&mut self, object: &RequestObject) -> Result<Option<AggregateFailure>> {
        let phase = object.phase();
        let tracker = self.trackers.entry(object.uid).or_default();
        match tracker.observe(phase) {
            Err(violation) => {
                return Err(Error::ProtocolViolation {
                    key: object.key().to_string(),
                    message: violation.to_string(),
                });
            }
            Ok(Transition::Unchanged(_)) => return Ok(None),
            Ok(_) => {}
        }

        match phase {
            Phase::Completed => {
                if self.succeeded.insert(object.uid) {
                    tracing::debug!(request = %object.key(), completed = self.succeeded.len(), "request completed");
                }
                Ok(None)
            }
            Phase::Failed | Phase::FailedValidation => Ok(Some(AggregateFailure {
                key: Some(object.key().clone()),
                cause: FailureCause::ControlPlane,
                phase: Some(phase),
                message: object.status.message.clone(),
            })),
            Phase::Pending | Phase::InProgress => Ok(None),
        }
    }

    fn apply_deleted(&mut self, object: &RequestObject) -> Result<Option<AggregateFailure>> {
        // The final phase may only arrive with the deletion.
        if object.phase().is_terminal() {
            return self.apply_current(object);
        }
        let finished = self
            .trackers
            .get(&object.uid)
            .and_then(PhaseTracker::current)
            .is_some_and(|p| p.is_terminal());
        if finished || self.succeeded.contains(&object.uid) {
            return Ok(None);
        }
        Ok(Some(AggregateFailure {
            key: Some(object.key().clone()),
            cause: FailureCause::Deleted,
            phase: None,
            message: format!("{} was deleted before reaching a terminal phase", object.key()),
        }))
    }
}

/// Waits for a population of requests to finish.
#[derive(Clone)]
pub struct CompletionAggregator {
    store: Arc<dyn RequestStore>,
    namespace: String,
    labels: BTreeMap<String, String>,
    config: ObservationConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for CompletionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionAggregator")
            .field("namespace", &self.namespace)
            .field("labels", &self.labels)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CompletionAggregator {
    /// Creates an aggregator over requests in `namespace`.
    #[must_use]
    pub fn new(
        store: Arc<dyn RequestStore>,
        namespace: impl Into<String>,
        config: ObservationConfig,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Only counts requests carrying this label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Uses `metrics` instead of a private recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FlowMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Waits until `expected_count` requests of `kind` completed, any failed,
    /// or `deadline` elapsed.
    ///
    /// `expected_count == 0` succeeds immediately without touching the store.
    ///
    /// # Errors
    ///
    /// - [`Error::ObservationFailure`] if the requests cannot be observed
    /// - [`Error::ProtocolViolation`] if a request's phase moves backwards
    pub async fn await_all(
        &self,
        kind: RequestKind,
        expected_count: usize,
        deadline: Duration,
    ) -> Result<AggregateOutcome> {
        self.await_all_cancellable(kind, expected_count, deadline, &CancellationToken::new())
            .await
    }

    /// Like [`await_all`](Self::await_all), but also stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`await_all`](Self::await_all), plus [`Error::Cancelled`].
    pub async fn await_all_cancellable(
        &self,
        kind: RequestKind,
        expected_count: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<AggregateOutcome> {
        let span = aggregate_span(kind.as_label(), &self.namespace, expected_count);
        self.run(kind, expected_count, deadline, cancel)
            .instrument(span)
            .await
    }

    fn scope(&self, kind: RequestKind) -> WatchScope {
        WatchScope {
            kind,
            namespace: self.namespace.clone(),
            name: None,
            labels: self.labels.clone(),
        }
    }

    async fn run(
        &self,
        kind: RequestKind,
        expected_count: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<AggregateOutcome> {
        if expected_count == 0 {
            tracing::debug!("nothing to wait for");
            self.metrics.record_aggregate(kind, "completed");
            return Ok(AggregateOutcome {
                succeeded_count: 0,
                expected_count,
                first_failure: None,
            });
        }

        let deadline_at = Instant::now() + deadline;
        let scope = self.scope(kind);
        let target = scope.to_string();
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled { target }),
            opened = timeout_at(
                deadline_at,
                ObservationSource::open(
                    Arc::clone(&self.store),
                    scope,
                    PollTarget::Scope,
                    self.config,
                    self.metrics.clone(),
                ),
            ) => opened,
        };
        let Ok(mut source) = opened else {
            tracing::warn!("watch subscription did not finish before the deadline");
            let outcome = AggregateOutcome {
                succeeded_count: 0,
                expected_count,
                first_failure: Some(timeout_failure(0, expected_count, deadline)),
            };
            self.finish(kind, &outcome);
            return Ok(outcome);
        };

        let mut tally = Tally::default();
        loop {
            // An observation ready at the deadline still counts.
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                observed = source.next() => Step::Observed(observed),
                () = sleep_until(deadline_at) => Step::Deadline,
            };

            let failure = match step {
                Step::Cancelled => return Err(Error::Cancelled { target }),
                Step::Deadline => Some(timeout_failure(
                    tally.succeeded.len(),
                    expected_count,
                    deadline,
                )),
                Step::Observed(observed) => tally.apply(observed?)?,
            };

            let succeeded_count = tally.succeeded.len();
            if failure.is_none() && succeeded_count < expected_count {
                continue;
            }

            let outcome = AggregateOutcome {
                succeeded_count,
                expected_count,
                first_failure: failure,
            };
            self.finish(kind, &outcome);
            return Ok(outcome);
        }
    }

    fn finish(&self, kind: RequestKind, outcome: &AggregateOutcome) {
        match &outcome.first_failure {
            None => {
                self.metrics.record_aggregate(kind, "completed");
                tracing::info!(completed = outcome.succeeded_count, "all requests completed");
            }
            Some(failure) => {
                self.metrics.record_aggregate(kind, failure.cause.as_label());
                tracing::warn!(
                    completed = outcome.succeeded_count,
                    expected = outcome.expected_count,
                    cause = failure.cause.as_label(),
                    message = %failure.message,
                    "aggregate wait failed"
                );
            }
        }
    }
}

fn timeout_failure(succeeded: usize, expected: usize, deadline: Duration) -> AggregateFailure {
    AggregateFailure {
        key: None,
        cause: FailureCause::Timeout,
        phase: None,
        message: format!("observed {succeeded} of {expected} complete within {deadline:?}"),
    }
}
