//! In-memory request store for testing.
//!
//! This module provides [`InMemoryRequestStore`], an implementation of the
//! [`RequestStore`] trait that also plays the control plane: tests drive
//! phase transitions directly or register a [`ControlPlaneScript`] that runs
//! for every newly created request of a kind.
//!
//! ## Fault Injection
//!
//! [`FaultConfig`] can reject or stall creates, fail or stall watch
//! subscriptions, fail polls or hide objects from them, and silently drop
//! notifications so that the polling fallback is exercised.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process visibility
//! - **Single-process only**: Notifications use an in-process broadcast channel

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use vsnap_core::{ObjectKey, ObjectUid};

use super::{CreateResult, RequestStore, WatchEvent, WatchEventType, WatchScope, WatchStream};
use crate::error::{Error, Result};
use crate::phase::RequestKind;
use crate::request::{RequestDescriptor, RequestObject, RequestStatus};

/// Default capacity of the notification channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Faults injected into store operations.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Reject every create with this message.
    pub reject_creates: Option<String>,
    /// Never complete a create call.
    pub stall_creates: bool,
    /// Fail this many upcoming `get`/`list` calls.
    pub failing_polls: u32,
    /// Fail every `get`/`list` call.
    pub fail_all_polls: bool,
    /// Hide every object from this many upcoming `get`/`list` calls, as a
    /// lagging read replica would.
    pub invisible_polls: u32,
    /// Fail every watch subscription.
    pub fail_watch: bool,
    /// Never complete a watch subscription.
    pub stall_watch: bool,
    /// Apply writes without notifying watchers.
    pub drop_notifications: bool,
}

/// One scripted status write.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    /// Delay before the write, measured from the previous step.
    pub delay: Duration,
    /// Status to write.
    pub status: RequestStatus,
}

/// Sequence of status writes applied to every new request of a kind.
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneScript {
    steps: Vec<ScriptStep>,
}

impl ControlPlaneScript {
    /// Creates an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves to `raw_phase` after `delay`.
    #[must_use]
    pub fn then_phase(mut self, delay: Duration, raw_phase: &str) -> Self {
        self.steps.push(ScriptStep {
            delay,
            status: RequestStatus {
                phase: raw_phase.to_string(),
                ..RequestStatus::default()
            },
        });
        self
    }

    /// Completes with `handle` after `delay`.
    #[must_use]
    pub fn then_complete(mut self, delay: Duration, handle: &str) -> Self {
        self.steps.push(ScriptStep {
            delay,
            status: RequestStatus {
                phase: "Completed".to_string(),
                message: String::new(),
                result_handle: Some(handle.to_string()),
            },
        });
        self
    }

    /// Fails with `message` after `delay`.
    #[must_use]
    pub fn then_fail(mut self, delay: Duration, message: &str) -> Self {
        self.steps.push(ScriptStep {
            delay,
            status: RequestStatus {
                phase: "Failed".to_string(),
                message: message.to_string(),
                result_handle: None,
            },
        });
        self
    }

    /// Returns the scripted steps.
    #[must_use]
    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<(RequestKind, ObjectKey), RequestObject>,
    next_version: u64,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

#[derive(Debug)]
struct Inner {
    state: RwLock<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    faults: Mutex<FaultConfig>,
    scripts: RwLock<HashMap<RequestKind, ControlPlaneScript>>,
    create_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

/// In-memory request store and control plane for testing.
///
/// Cloning yields another handle to the same store.
///
/// ## Example
///
/// ```rust
/// use vsnap_flow::store::memory::InMemoryRequestStore;
///
/// let store = InMemoryRequestStore::new();
/// assert_eq!(store.object_count().unwrap(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryRequestStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("request store lock poisoned")
}

impl InMemoryRequestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a store whose notification channel holds `capacity` events.
    ///
    /// Watchers that fall further behind observe a lag error.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(StoreState::default()),
                events,
                faults: Mutex::new(FaultConfig::default()),
                scripts: RwLock::new(HashMap::new()),
                create_calls: AtomicUsize::new(0),
                poll_calls: AtomicUsize::new(0),
                watch_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Replaces the injected faults.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn configure_faults(&self, faults: FaultConfig) -> Result<()> {
        *self.inner.faults.lock().map_err(poison_err)? = faults;
        Ok(())
    }

    /// Registers a script run for every request of `kind` created from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn script(&self, kind: RequestKind, script: ControlPlaneScript) -> Result<()> {
        self.inner
            .scripts
            .write()
            .map_err(poison_err)?
            .insert(kind, script);
        Ok(())
    }

    /// Writes a request status, as the control plane would.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] wrapping not-found if the object does not exist.
    pub fn set_status(
        &self,
        kind: RequestKind,
        key: &ObjectKey,
        status: RequestStatus,
    ) -> Result<RequestObject> {
        let drop_notifications = self.faults()?.drop_notifications;
        let mut state = self.inner.state.write().map_err(poison_err)?;
        let version = state.bump();
        let Some(object) = state.objects.get_mut(&(kind, key.clone())) else {
            return Err(vsnap_core::Error::resource_not_found(kind.resource_kind(), key).into());
        };
        object.status = status;
        object.resource_version = version;
        let updated = object.clone();
        if !drop_notifications {
            let _ = self.inner.events.send(WatchEvent {
                event_type: WatchEventType::Modified,
                object: updated.clone(),
            });
        }
        drop(state);
        Ok(updated)
    }

    /// Moves a request to `raw_phase`, keeping message and handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not exist.
    pub fn set_phase(
        &self,
        kind: RequestKind,
        key: &ObjectKey,
        raw_phase: &str,
    ) -> Result<RequestObject> {
        let mut status = self
            .snapshot(kind, key)?
            .ok_or_else(|| vsnap_core::Error::resource_not_found(kind.resource_kind(), key))?
            .status;
        status.phase = raw_phase.to_string();
        self.set_status(kind, key, status)
    }

    /// Completes a request with an optional result handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not exist.
    pub fn complete(
        &self,
        kind: RequestKind,
        key: &ObjectKey,
        handle: Option<&str>,
    ) -> Result<RequestObject> {
        self.set_status(
            kind,
            key,
            RequestStatus {
                phase: "Completed".to_string(),
                message: String::new(),
                result_handle: handle.map(str::to_string),
            },
        )
    }

    /// Fails a request with `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not exist.
    pub fn fail(&self, kind: RequestKind, key: &ObjectKey, message: &str) -> Result<RequestObject> {
        self.set_status(
            kind,
            key,
            RequestStatus {
                phase: "Failed".to_string(),
                message: message.to_string(),
                result_handle: None,
            },
        )
    }

    /// Deletes a request, notifying watchers.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn delete(&self, kind: RequestKind, key: &ObjectKey) -> Result<Option<RequestObject>> {
        let drop_notifications = self.faults()?.drop_notifications;
        let mut state = self.inner.state.write().map_err(poison_err)?;
        let removed = state.objects.remove(&(kind, key.clone()));
        if let Some(object) = &removed {
            if !drop_notifications {
                let _ = self.inner.events.send(WatchEvent {
                    event_type: WatchEventType::Deleted,
                    object: object.clone(),
                });
            }
        }
        drop(state);
        Ok(removed)
    }

    /// Reads an object without counting it as a poll or applying faults.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self, kind: RequestKind, key: &ObjectKey) -> Result<Option<RequestObject>> {
        let state = self.inner.state.read().map_err(poison_err)?;
        Ok(state.objects.get(&(kind, key.clone())).cloned())
    }

    /// Waits until an object of `kind` matching `key` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub async fn wait_for(&self, kind: RequestKind, key: &ObjectKey) -> Result<RequestObject> {
        loop {
            if let Some(object) = self.snapshot(kind, key)? {
                return Ok(object);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Returns every stored object of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn objects(&self, kind: RequestKind) -> Result<Vec<RequestObject>> {
        let state = self.inner.state.read().map_err(poison_err)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        let state = self.inner.state.read().map_err(poison_err)?;
        Ok(state.objects.len())
    }

    /// Number of `create` calls, including idempotent repeats.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.inner.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `get` and `list` calls.
    #[must_use]
    pub fn poll_calls(&self) -> usize {
        self.inner.poll_calls.load(Ordering::SeqCst)
    }

    /// Number of `watch` calls.
    #[must_use]
    pub fn watch_calls(&self) -> usize {
        self.inner.watch_calls.load(Ordering::SeqCst)
    }

    fn faults(&self) -> Result<FaultConfig> {
        Ok(self.inner.faults.lock().map_err(poison_err)?.clone())
    }

    /// Applies poll faults; returns whether stored objects are visible.
    fn check_poll_fault(&self) -> Result<bool> {
        self.inner.poll_calls.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.inner.faults.lock().map_err(poison_err)?;
        if faults.fail_all_polls {
            drop(faults);
            return Err(Error::storage("injected poll failure"));
        }
        if faults.failing_polls > 0 {
            faults.failing_polls -= 1;
            drop(faults);
            return Err(Error::storage("injected poll failure"));
        }
        if faults.invisible_polls > 0 {
            faults.invisible_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn spawn_script(&self, kind: RequestKind, key: ObjectKey) -> Result<()> {
        let script = self.inner.scripts.read().map_err(poison_err)?.get(&kind).cloned();
        let Some(script) = script else {
            return Ok(());
        };

        let store = self.clone();
        tokio::spawn(async move {
            for step in script.steps {
                tokio::time::sleep(step.delay).await;
                if let Err(e) = store.set_status(kind, &key, step.status) {
                    tracing::debug!(key = %key, error = %e, "control-plane script stopped");
                    break;
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, descriptor: &RequestDescriptor) -> Result<CreateResult> {
        self.inner.create_calls.fetch_add(1, Ordering::SeqCst);
        let faults = self.faults()?;
        if faults.stall_creates {
            std::future::pending::<()>().await;
        }
        if let Some(message) = faults.reject_creates {
            return Err(Error::storage(message));
        }

        let kind = descriptor.kind();
        let key = descriptor.key().clone();
        let created = {
            let mut state = self.inner.state.write().map_err(poison_err)?;
            if let Some(existing) = state.objects.get(&(kind, key.clone())) {
                return Ok(CreateResult::AlreadyExists(existing.clone()));
            }
            let uid = ObjectUid::generate();
            let object = RequestObject {
                descriptor: descriptor.clone(),
                uid,
                resource_version: state.bump(),
                created_at: Utc::now(),
                status: RequestStatus {
                    phase: "New".to_string(),
                    ..RequestStatus::default()
                },
            };
            state.objects.insert((kind, key.clone()), object.clone());
            if !faults.drop_notifications {
                let _ = self.inner.events.send(WatchEvent {
                    event_type: WatchEventType::Added,
                    object: object.clone(),
                });
            }
            object
        };

        self.spawn_script(kind, key)?;
        Ok(CreateResult::Created(created))
    }

    async fn get(&self, kind: RequestKind, key: &ObjectKey) -> Result<Option<RequestObject>> {
        if !self.check_poll_fault()? {
            return Ok(None);
        }
        self.snapshot(kind, key)
    }

    async fn list(&self, scope: &WatchScope) -> Result<Vec<RequestObject>> {
        if !self.check_poll_fault()? {
            return Ok(Vec::new());
        }
        let state = self.inner.state.read().map_err(poison_err)?;
        Ok(state
            .objects
            .values()
            .filter(|obj| scope.matches(obj))
            .cloned()
            .collect())
    }

    async fn watch(&self, scope: &WatchScope) -> Result<WatchStream> {
        self.inner.watch_calls.fetch_add(1, Ordering::SeqCst);
        let faults = self.faults()?;
        if faults.stall_watch {
            std::future::pending::<()>().await;
        }
        if faults.fail_watch {
            return Err(Error::storage("injected watch failure"));
        }

        // Subscribe under the read lock so no write lands between the
        // replay and the live stream.
        let (initial, receiver) = {
            let state = self.inner.state.read().map_err(poison_err)?;
            let receiver = self.inner.events.subscribe();
            let initial: Vec<Result<WatchEvent>> = state
                .objects
                .values()
                .filter(|obj| scope.matches(obj))
                .map(|obj| {
                    Ok(WatchEvent {
                        event_type: WatchEventType::Added,
                        object: obj.clone(),
                    })
                })
                .collect();
            (initial, receiver)
        };

        let scope = scope.clone();
        let live = stream::unfold(receiver, move |mut receiver| {
            let scope = scope.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if scope.matches(&event.object) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            let err = Error::storage(format!(
                                "watch fell behind, {missed} notifications lost"
                            ));
                            return Some((Err(err), receiver));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(initial).chain(live).boxed())
    }
}
