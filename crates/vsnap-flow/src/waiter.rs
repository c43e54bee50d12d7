//! Submit a request and block until it reaches a terminal phase.
//!
//! [`TerminalWaiter`] is the single-request half of the engine. Each call:
//!
//! 1. opens an observation source scoped to the request (watch + poll),
//! 2. creates the request object, reusing an existing one with the same
//!    identity and source,
//! 3. consumes observations until an accepted or terminal phase, deletion,
//!    cancellation, or the deadline.
//!
//! The deadline covers all three steps, so a hung subscription or create
//! still ends in a timeout outcome.
//!
//! Every call produces exactly one [`WaitOutcome`] or one error; the
//! subscription and poll timer are released when the call returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use vsnap_core::ObjectKey;
use vsnap_core::observability::request_span;

use crate::config::ObservationConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::observe::{Observation, ObservationSource, PollTarget};
use crate::phase::{Phase, PhaseTracker, RequestKind, Transition};
use crate::request::{FailureCause, RequestDescriptor, RequestObject, WaitFailure, WaitOutcome};
use crate::store::{CreateResult, RequestStore, WatchScope};

enum Step {
    Cancelled,
    Deadline,
    Observed(Result<Observation>),
}

/// Drives single requests from submission to a terminal phase.
///
/// Cheap to clone; clones share the store and metrics.
#[derive(Clone)]
pub struct TerminalWaiter {
    store: Arc<dyn RequestStore>,
    config: ObservationConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for TerminalWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalWaiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TerminalWaiter {
    /// Creates a waiter over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>, config: ObservationConfig) -> Self {
        Self {
            store,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Uses `metrics` instead of a private recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FlowMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the store this waiter submits to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Returns the observation settings.
    #[must_use]
    pub const fn config(&self) -> ObservationConfig {
        self.config
    }

    /// Returns the metrics recorder.
    #[must_use]
    pub fn metrics(&self) -> &FlowMetrics {
        &self.metrics
    }

    /// Submits `descriptor` and waits until it reaches a phase in `acceptable`
    /// or any terminal phase. An empty `acceptable` accepts every terminal phase.
    ///
    /// A control-plane failure, a terminal phase outside `acceptable`, a
    /// deletion, and the deadline all yield an `Ok` outcome carrying a
    /// [`WaitFailure`].
    ///
    /// # Errors
    ///
    /// - [`Error::SubmissionFailure`] if the create is rejected or collides
    ///   with a request from a different source
    /// - [`Error::ObservationFailure`] if the request cannot be observed
    /// - [`Error::ProtocolViolation`] if the phase moves backwards
    pub async fn submit_and_wait(
        &self,
        descriptor: &RequestDescriptor,
        acceptable: &[Phase],
        deadline: Duration,
    ) -> Result<WaitOutcome> {
        self.submit_and_wait_cancellable(descriptor, acceptable, deadline, &CancellationToken::new())
            .await
    }

    /// Like [`submit_and_wait`](Self::submit_and_wait), but also stops when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`submit_and_wait`](Self::submit_and_wait), plus
    /// [`Error::Cancelled`] when the token fires first.
    pub async fn submit_and_wait_cancellable(
        &self,
        descriptor: &RequestDescriptor,
        acceptable: &[Phase],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let key = descriptor.key();
        let span = request_span(
            "submit_and_wait",
            descriptor.kind().as_label(),
            key.namespace(),
            key.name(),
        );
        self.run(descriptor, acceptable, deadline, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        descriptor: &RequestDescriptor,
        acceptable: &[Phase],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let deadline_at = started + deadline;
        let kind = descriptor.kind();
        let key = descriptor.key().clone();
        let _in_flight = self.metrics.wait_started(kind);

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled(&key)),
            opened = timeout_at(deadline_at, self.open_and_submit(descriptor)) => opened,
        };
        let Ok(opened) = opened else {
            tracing::warn!("submission did not finish before the deadline");
            let outcome = timeout_outcome(&key, None, deadline, started);
            self.finish(kind, &outcome);
            return Ok(outcome);
        };
        let mut source = opened?;

        let mut tracker = PhaseTracker::new();
        loop {
            // An observation ready at the deadline still counts.
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                observed = source.next() => Step::Observed(observed),
                () = sleep_until(deadline_at) => Step::Deadline,
            };

            let outcome = match step {
                Step::Cancelled => return Err(cancelled(&key)),
                Step::Deadline => timeout_outcome(&key, tracker.current(), deadline, started),
                Step::Observed(observed) => match observed? {
                    Observation::Current(object) => {
                        match evaluate(&key, &object, &mut tracker, acceptable, started)? {
                            Some(outcome) => outcome,
                            None => continue,
                        }
                    }
                    // The final phase may only arrive with the deletion.
                    Observation::Deleted(object) if object.phase().is_terminal() => {
                        evaluate(&key, &object, &mut tracker, acceptable, started)?
                            .unwrap_or_else(|| deleted_outcome(&key, started))
                    }
                    Observation::Deleted(_) => deleted_outcome(&key, started),
                },
            };

            self.finish(kind, &outcome);
            return Ok(outcome);
        }
    }

    /// Opens the observation source, then creates the request.
    async fn open_and_submit(&self, descriptor: &RequestDescriptor) -> Result<ObservationSource> {
        let kind = descriptor.kind();
        let key = descriptor.key();

        // Subscribe before creating so the first transitions are not missed.
        let mut source = ObservationSource::open(
            Arc::clone(&self.store),
            WatchScope::object(kind, key),
            PollTarget::Object(key.clone()),
            self.config,
            self.metrics.clone(),
        )
        .await;

        let created = self.submit(descriptor).await?;
        source.prime(created);
        Ok(source)
    }

    async fn submit(&self, descriptor: &RequestDescriptor) -> Result<RequestObject> {
        let kind = descriptor.kind();
        let key = descriptor.key();
        match self.store.create(descriptor).await {
            Ok(CreateResult::Created(object)) => {
                self.metrics.record_submission(kind, "created");
                tracing::info!(uid = %object.uid, "request created");
                Ok(object)
            }
            Ok(CreateResult::AlreadyExists(object)) => {
                if object.descriptor.source() != descriptor.source() {
                    self.metrics.record_submission(kind, "conflict");
                    return Err(Error::SubmissionFailure {
                        key: key.to_string(),
                        message: "an existing request with this name has a different source"
                            .to_string(),
                        source: None,
                    });
                }
                self.metrics.record_submission(kind, "already_exists");
                tracing::info!(uid = %object.uid, phase = %object.status.phase, "reusing existing request");
                Ok(object)
            }
            Err(e) => {
                self.metrics.record_submission(kind, "rejected");
                tracing::warn!(error = %e, "request rejected");
                Err(Error::SubmissionFailure {
                    key: key.to_string(),
                    message: e.to_string(),
                    source: Some(Box::new(e)),
                })
            }
        }
    }

    fn finish(&self, kind: RequestKind, outcome: &WaitOutcome) {
        let label = outcome
            .failure
            .as_ref()
            .map_or(outcome.final_phase.as_label(), |f| f.cause.as_label());
        self.metrics.record_wait(kind, label, outcome.elapsed);
        match &outcome.failure {
            None => tracing::info!(
                phase = %outcome.final_phase,
                elapsed_ms = duration_ms(outcome.elapsed),
                "request finished"
            ),
            Some(failure) => tracing::warn!(
                phase = %outcome.final_phase,
                cause = failure.cause.as_label(),
                message = %failure.message,
                elapsed_ms = duration_ms(outcome.elapsed),
                "request did not succeed"
            ),
        }
    }
}

/// Applies one observation; returns the outcome once the wait is over.
fn evaluate(
    key: &ObjectKey,
    object: &RequestObject,
    tracker: &mut PhaseTracker,
    acceptable: &[Phase],
    started: Instant,
) -> Result<Option<WaitOutcome>> {
    let phase = object.phase();
    match tracker.observe(phase) {
        Err(violation) => {
            return Err(Error::ProtocolViolation {
                key: key.to_string(),
                message: violation.to_string(),
            });
        }
        Ok(Transition::Unchanged(_)) => return Ok(None),
        Ok(_) => tracing::debug!(phase = %phase, raw = %object.status.phase, "phase observed"),
    }

    let accepted = acceptable.contains(&phase) || (acceptable.is_empty() && phase.is_terminal());
    if !accepted && !phase.is_terminal() {
        return Ok(None);
    }

    let failure = if !accepted {
        Some(WaitFailure {
            cause: FailureCause::Unaccepted,
            message: if object.status.message.is_empty() {
                format!("reached phase {phase}, which the caller does not accept")
            } else {
                object.status.message.clone()
            },
        })
    } else if phase.is_failure() {
        Some(WaitFailure {
            cause: FailureCause::ControlPlane,
            message: object.status.message.clone(),
        })
    } else {
        None
    };

    Ok(Some(WaitOutcome {
        key: key.clone(),
        final_phase: phase,
        result_handle: if failure.is_none() {
            object.status.result_handle.clone()
        } else {
            None
        },
        failure,
        elapsed: started.elapsed(),
    }))
}

fn timeout_outcome(
    key: &ObjectKey,
    last: Option<Phase>,
    deadline: Duration,
    started: Instant,
) -> WaitOutcome {
    let last = last.map_or_else(|| "none".to_string(), |p| p.to_string());
    WaitOutcome {
        key: key.clone(),
        final_phase: Phase::Failed,
        result_handle: None,
        failure: Some(WaitFailure {
            cause: FailureCause::Timeout,
            message: format!(
                "no terminal phase within {deadline:?} (last observed phase {last})"
            ),
        }),
        elapsed: started.elapsed(),
    }
}

fn cancelled(key: &ObjectKey) -> Error {
    tracing::info!("wait cancelled");
    Error::Cancelled {
        target: key.to_string(),
    }
}

fn deleted_outcome(key: &ObjectKey, started: Instant) -> WaitOutcome {
    WaitOutcome {
        key: key.clone(),
        final_phase: Phase::Failed,
        result_handle: None,
        failure: Some(WaitFailure {
            cause: FailureCause::Deleted,
            message: format!("{key} was deleted before reaching a terminal phase"),
        }),
        elapsed: started.elapsed(),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SourceReference;
    use crate::store::memory::{ControlPlaneScript, FaultConfig, InMemoryRequestStore};

    fn descriptor(name: &str, snapshot: &str) -> RequestDescriptor {
        RequestDescriptor::new(
            RequestKind::Clone,
            ObjectKey::new("demo", name).unwrap(),
            SourceReference {
                snapshot_id: snapshot.into(),
                kind: "PersistentVolumeClaim".into(),
                ..SourceReference::default()
            },
        )
    }

    fn waiter(store: &InMemoryRequestStore) -> TerminalWaiter {
        TerminalWaiter::new(
            Arc::new(store.clone()),
            ObservationConfig {
                poll_interval: Duration::from_millis(200),
                poll_retry_budget: 3,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn completed_request_returns_handle() {
        let store = InMemoryRequestStore::new();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new()
                    .then_phase(Duration::from_secs(1), "InProgress")
                    .then_complete(Duration::from_secs(2), "pvc-restored-1"),
            )
            .unwrap();

        let outcome = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.final_phase, Phase::Completed);
        assert_eq!(outcome.result_handle.as_deref(), Some("pvc-restored-1"));
        assert!(outcome.elapsed >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_request_keeps_message_verbatim() {
        let store = InMemoryRequestStore::new();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new().then_fail(Duration::from_secs(1), "Datastore ds-1 is full"),
            )
            .unwrap();

        let outcome = waiter(&store)
            .submit_and_wait(
                &descriptor("c1", "snap-123"),
                &[Phase::Completed, Phase::Failed],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(outcome.final_phase, Phase::Failed);
        assert_eq!(outcome.failure_message(), Some("Datastore ds-1 is full"));
        assert!(!outcome.is_timeout());
        assert!(outcome.result_handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unaccepted_terminal_phase_is_an_error_outcome() {
        let store = InMemoryRequestStore::new();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new().then_phase(Duration::from_secs(1), "FailedValidation"),
            )
            .unwrap();

        let outcome = waiter(&store)
            .submit_and_wait(
                &descriptor("c1", "snap-123"),
                &[Phase::Completed, Phase::Failed],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(outcome.final_phase, Phase::FailedValidation);
        assert_eq!(
            outcome.failure.as_ref().map(|f| f.cause),
            Some(FailureCause::Unaccepted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_timeout_outcome() {
        let store = InMemoryRequestStore::new();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new().then_phase(Duration::from_secs(1), "InProgress"),
            )
            .unwrap();

        let outcome = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(10))
            .await
            .unwrap();
        assert!(outcome.is_timeout());
        assert_eq!(outcome.final_phase, Phase::Failed);
        let message = outcome.failure_message().unwrap();
        assert!(message.contains("InProgress"), "{message}");
        assert!(outcome.elapsed >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn request_stuck_in_pending_times_out() {
        let store = InMemoryRequestStore::new();
        let outcome = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(1))
            .await
            .unwrap();
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.cause, FailureCause::Timeout);
        assert!(failure.message.contains("Pending"), "{}", failure.message);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_reuses_existing_request() {
        let store = InMemoryRequestStore::new();
        let waiter = waiter(&store);
        let request = descriptor("c1", "snap-123");
        let key = request.key().clone();

        let first = {
            let waiter = waiter.clone();
            let request = request.clone();
            tokio::spawn(async move {
                waiter
                    .submit_and_wait(&request, &[], Duration::from_secs(60))
                    .await
            })
        };
        store.wait_for(RequestKind::Clone, &key).await.unwrap();
        let second = {
            let waiter = waiter.clone();
            let request = request.clone();
            tokio::spawn(async move {
                waiter
                    .submit_and_wait(&request, &[], Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.complete(RequestKind::Clone, &key, Some("pvc-1")).unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.result_handle, second.result_handle);
        assert_eq!(store.object_count().unwrap(), 1);
        assert_eq!(store.create_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn name_collision_with_other_source_is_rejected() {
        let store = InMemoryRequestStore::new();
        store.create(&descriptor("c1", "snap-999")).await.unwrap();

        let err = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmissionFailure { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_create_is_a_submission_failure() {
        let store = InMemoryRequestStore::new();
        store
            .configure_faults(FaultConfig {
                reject_creates: Some("namespace demo is terminating".into()),
                ..FaultConfig::default()
            })
            .unwrap();

        let err = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmissionFailure { .. }));
        assert!(err.to_string().contains("namespace demo is terminating"));
    }

    #[tokio::test(start_paused = true)]
    async fn phase_regression_is_a_protocol_violation() {
        let store = InMemoryRequestStore::new();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new()
                    .then_phase(Duration::from_secs(1), "InProgress")
                    .then_phase(Duration::from_secs(1), "New"),
            )
            .unwrap();

        let err = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_before_terminal_is_reported() {
        let store = InMemoryRequestStore::new();
        let waiter = waiter(&store);
        let request = descriptor("c1", "snap-123");
        let key = request.key().clone();
        let handle = tokio::spawn(async move {
            waiter
                .submit_and_wait(&request, &[], Duration::from_secs(60))
                .await
        });
        store.wait_for(RequestKind::Clone, &key).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.delete(RequestKind::Clone, &key).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome.failure.as_ref().map(|f| f.cause),
            Some(FailureCause::Deleted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completion_carried_by_deletion_is_a_success() {
        let store = InMemoryRequestStore::new();
        let waiter = waiter(&store);
        let request = descriptor("c1", "snap-123");
        let key = request.key().clone();
        let handle = tokio::spawn(async move {
            waiter
                .submit_and_wait(&request, &[], Duration::from_secs(60))
                .await
        });
        store.wait_for(RequestKind::Clone, &key).await.unwrap();

        store
            .configure_faults(FaultConfig {
                drop_notifications: true,
                ..FaultConfig::default()
            })
            .unwrap();
        store.complete(RequestKind::Clone, &key, Some("pvc-1")).unwrap();
        store.configure_faults(FaultConfig::default()).unwrap();
        store.delete(RequestKind::Clone, &key).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.result_handle.as_deref(), Some("pvc-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_reads_do_not_end_the_wait() {
        let store = InMemoryRequestStore::new();
        store
            .configure_faults(FaultConfig {
                fail_watch: true,
                invisible_polls: 1,
                ..FaultConfig::default()
            })
            .unwrap();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new().then_complete(Duration::from_secs(5), "pvc-1"),
            )
            .unwrap();

        let outcome = waiter(&store)
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.result_handle.as_deref(), Some("pvc-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_create_ends_at_the_deadline() {
        let store = InMemoryRequestStore::new();
        store
            .configure_faults(FaultConfig {
                stall_creates: true,
                ..FaultConfig::default()
            })
            .unwrap();

        let w = waiter(&store);
        let desc = descriptor("c1", "snap-123");
        let call = w.submit_and_wait(
            &desc,
            &[],
            Duration::from_secs(1),
        );
        let outcome = tokio::time::timeout(Duration::from_secs(3600), call)
            .await
            .expect("wait ended at its deadline")
            .unwrap();
        assert!(outcome.is_timeout());
        assert!(outcome.elapsed >= Duration::from_secs(1));
        assert!(outcome.elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_watch_ends_at_the_deadline() {
        let store = InMemoryRequestStore::new();
        store
            .configure_faults(FaultConfig {
                stall_watch: true,
                ..FaultConfig::default()
            })
            .unwrap();

        let w = waiter(&store);
        let desc = descriptor("c1", "snap-123");
        let call = w.submit_and_wait(
            &desc,
            &[],
            Duration::from_secs(1),
        );
        let outcome = tokio::time::timeout(Duration::from_secs(3600), call)
            .await
            .expect("wait ended at its deadline")
            .unwrap();
        assert!(outcome.is_timeout());
        assert_eq!(store.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_phase_seen_at_the_deadline_wins() {
        let store = InMemoryRequestStore::new();
        store
            .configure_faults(FaultConfig {
                fail_watch: true,
                ..FaultConfig::default()
            })
            .unwrap();
        store
            .script(
                RequestKind::Clone,
                ControlPlaneScript::new().then_complete(Duration::from_millis(500), "pvc-1"),
            )
            .unwrap();
        let waiter = TerminalWaiter::new(
            Arc::new(store.clone()),
            ObservationConfig {
                poll_interval: Duration::from_secs(1),
                poll_retry_budget: 3,
            },
        );

        // The only poll that sees the completion fires exactly at the deadline.
        let outcome = waiter
            .submit_and_wait(&descriptor("c1", "snap-123"), &[], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.result_handle.as_deref(), Some("pvc-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_wait() {
        let store = InMemoryRequestStore::new();
        let cancel = CancellationToken::new();
        let waiter = waiter(&store);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            waiter
                .submit_and_wait_cancellable(
                    &descriptor("c1", "snap-123"),
                    &[],
                    Duration::from_secs(60),
                    &token,
                )
                .await
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
