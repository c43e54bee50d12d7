//! Merged watch + poll observation of request objects.
//!
//! [`ObservationSource`] turns a watch subscription and a fixed-interval poll
//! into one stream of [`Observation`]s, de-duplicated by object uid and raw
//! phase. Watch failures are not fatal: the source keeps polling, tries to
//! resubscribe on every tick, and escalates to
//! [`Error::ObservationFailure`] only when polls also fail more often in a
//! row than the retry budget allows.
//!
//! Reads may lag writes, so while polling alone an object counts as deleted
//! only after a poll has returned it and [`ABSENT_POLLS_FOR_DELETION`]
//! consecutive polls have then missed it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use tokio::time::{Interval, MissedTickBehavior};

use vsnap_core::{ObjectKey, ObjectUid};

use crate::config::ObservationConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::request::RequestObject;
use crate::store::{RequestStore, WatchEvent, WatchEventType, WatchScope, WatchStream};

/// Consecutive polls an object must be missing from before it counts as deleted.
pub(crate) const ABSENT_POLLS_FOR_DELETION: u32 = 2;

/// A change worth acting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observation {
    /// The object exists with a phase not seen before.
    Current(RequestObject),
    /// The object is gone; carries its last known state.
    Deleted(RequestObject),
}

/// What a poll reads.
#[derive(Debug, Clone)]
pub(crate) enum PollTarget {
    /// A single object, read with `get`.
    Object(ObjectKey),
    /// Every object in the watch scope, read with `list`.
    Scope,
}

/// Consecutive-failure budget for polls.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryBudget {
    tolerated: u32,
    consecutive: u32,
}

impl RetryBudget {
    pub(crate) const fn new(tolerated: u32) -> Self {
        Self {
            tolerated,
            consecutive: 0,
        }
    }

    /// Records a failure and returns the consecutive count.
    pub(crate) fn record_failure(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub(crate) const fn exhausted(&self) -> bool {
        self.consecutive > self.tolerated
    }
}

enum Step {
    Event(Option<Result<WatchEvent>>),
    Tick,
}

/// One merged observation source. Dropping it closes the watch and stops polling.
pub(crate) struct ObservationSource {
    store: Arc<dyn RequestStore>,
    scope: WatchScope,
    target: PollTarget,
    watch: Option<WatchStream>,
    ticker: Interval,
    pending: VecDeque<Observation>,
    seen: HashMap<ObjectUid, RequestObject>,
    polled: HashSet<ObjectUid>,
    absent: HashMap<ObjectUid, u32>,
    gone: HashSet<ObjectUid>,
    budget: RetryBudget,
    metrics: FlowMetrics,
}

impl ObservationSource {
    /// Opens the watch (falling back to polling if that fails) and arms the poll timer.
    pub(crate) async fn open(
        store: Arc<dyn RequestStore>,
        scope: WatchScope,
        target: PollTarget,
        config: ObservationConfig,
        metrics: FlowMetrics,
    ) -> Self {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut source = Self {
            store,
            scope,
            target,
            watch: None,
            ticker,
            pending: VecDeque::new(),
            seen: HashMap::new(),
            polled: HashSet::new(),
            absent: HashMap::new(),
            gone: HashSet::new(),
            budget: RetryBudget::new(config.poll_retry_budget),
            metrics,
        };
        source.subscribe().await;
        source
    }

    /// Feeds an object obtained outside the source, such as a create result.
    pub(crate) fn prime(&mut self, object: RequestObject) {
        self.accept(object);
    }

    /// Returns true while the watch subscription is healthy.
    #[cfg(test)]
    pub(crate) const fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Waits for the next observation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObservationFailure`] once the watch is down and the
    /// poll retry budget is exhausted.
    pub(crate) async fn next(&mut self) -> Result<Observation> {
        loop {
            if let Some(observation) = self.pending.pop_front() {
                return Ok(observation);
            }

            let step = tokio::select! {
                event = next_event(&mut self.watch) => Step::Event(event),
                _ = self.ticker.tick() => Step::Tick,
            };

            match step {
                Step::Event(Some(Ok(event))) => match event.event_type {
                    WatchEventType::Added | WatchEventType::Modified => self.accept(event.object),
                    WatchEventType::Deleted => self.accept_deleted(event.object),
                },
                Step::Event(Some(Err(e))) => {
                    self.metrics.record_observation_error("watch");
                    tracing::warn!(scope = %self.scope, error = %e, "watch failed, falling back to polling");
                    self.watch = None;
                }
                Step::Event(None) => {
                    tracing::debug!(scope = %self.scope, "watch closed, falling back to polling");
                    self.watch = None;
                }
                Step::Tick => self.poll().await?,
            }
        }
    }

    async fn subscribe(&mut self) {
        match self.store.watch(&self.scope).await {
            Ok(stream) => {
                tracing::debug!(scope = %self.scope, "watch subscribed");
                self.watch = Some(stream);
            }
            Err(e) => {
                self.metrics.record_observation_error("watch");
                tracing::warn!(scope = %self.scope, error = %e, "watch unavailable, polling only");
            }
        }
    }

    async fn poll(&mut self) -> Result<()> {
        if self.watch.is_none() {
            self.subscribe().await;
        }

        let polled = match &self.target {
            PollTarget::Object(key) => self
                .store
                .get(self.scope.kind, key)
                .await
                .map(|obj| obj.into_iter().collect::<Vec<_>>()),
            PollTarget::Scope => self.store.list(&self.scope).await,
        };

        match polled {
            Ok(objects) => {
                self.budget.reset();
                self.accept_poll(objects);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_observation_error("poll");
                let attempts = self.budget.record_failure();
                tracing::warn!(scope = %self.scope, attempts, error = %e, "poll failed");
                if self.watch.is_none() && self.budget.exhausted() {
                    return Err(Error::ObservationFailure {
                        target: self.scope.to_string(),
                        attempts,
                        message: e.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    fn accept_poll(&mut self, objects: Vec<RequestObject>) {
        let present: HashSet<ObjectUid> = objects.iter().map(|obj| obj.uid).collect();
        for object in objects {
            self.polled.insert(object.uid);
            self.absent.remove(&object.uid);
            self.accept(object);
        }

        if self.watch.is_some() {
            self.absent.clear();
            return;
        }

        // Without a watch, absence from polls is the only deletion signal.
        let mut deleted = Vec::new();
        for (uid, object) in &self.seen {
            if present.contains(uid) || !self.polled.contains(uid) {
                continue;
            }
            let misses = self.absent.entry(*uid).or_insert(0);
            *misses += 1;
            if *misses >= ABSENT_POLLS_FOR_DELETION {
                deleted.push(object.clone());
            } else {
                tracing::debug!(scope = %self.scope, uid = %uid, "object missing from poll");
            }
        }
        for object in deleted {
            self.accept_deleted(object);
        }
    }

    fn accept(&mut self, object: RequestObject) {
        if self.gone.contains(&object.uid) {
            return;
        }
        if let Some(last) = self.seen.get(&object.uid) {
            if object.resource_version <= last.resource_version {
                return;
            }
            if last.status.phase == object.status.phase {
                self.seen.insert(object.uid, object);
                return;
            }
        }
        self.seen.insert(object.uid, object.clone());
        self.pending.push_back(Observation::Current(object));
    }

    fn accept_deleted(&mut self, object: RequestObject) {
        if !self.gone.insert(object.uid) {
            return;
        }
        self.seen.remove(&object.uid);
        self.polled.remove(&object.uid);
        self.absent.remove(&object.uid);
        self.pending.push_back(Observation::Deleted(object));
    }
}

async fn next_event(watch: &mut Option<WatchStream>) -> Option<Result<WatchEvent>> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
