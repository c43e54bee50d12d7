//! Pluggable access to control-plane request objects.
//!
//! The [`RequestStore`] trait is the only way the engine talks to the
//! control plane. Production bindings wrap an API client; the in-memory
//! implementation in [`memory`] doubles as a scriptable control plane for
//! tests.
//!
//! ## Contract
//!
//! - `create` is safe to call twice with the same identity: the second call
//!   reports [`CreateResult::AlreadyExists`] with the stored object.
//! - `watch` first replays every object already in scope as
//!   [`WatchEventType::Added`], then streams live changes. A stream error
//!   means notifications were lost; callers recover by polling.
//! - Status writes belong to the control plane. The engine never patches
//!   request objects.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use vsnap_core::ObjectKey;

use crate::error::Result;
use crate::phase::RequestKind;
use crate::request::{RequestDescriptor, RequestObject};

/// Result of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateResult {
    /// A new object was stored.
    Created(RequestObject),
    /// An object with the same identity already existed; it is returned
    /// unchanged.
    AlreadyExists(RequestObject),
}

impl CreateResult {
    /// Returns the stored object.
    #[must_use]
    pub fn object(&self) -> &RequestObject {
        match self {
            Self::Created(obj) | Self::AlreadyExists(obj) => obj,
        }
    }

    /// Consumes the result, returning the stored object.
    #[must_use]
    pub fn into_object(self) -> RequestObject {
        match self {
            Self::Created(obj) | Self::AlreadyExists(obj) => obj,
        }
    }

    /// Returns true if the object already existed.
    #[must_use]
    pub const fn already_existed(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Type of a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    /// The object appeared (or existed when the watch opened).
    Added,
    /// The object changed.
    Modified,
    /// The object was removed.
    Deleted,
}

/// A watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Notification type.
    pub event_type: WatchEventType,
    /// The object after the change (before, for deletions).
    pub object: RequestObject,
}

/// Filter selecting which objects a watch or list covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchScope {
    /// Request kind.
    pub kind: RequestKind,
    /// Namespace.
    pub namespace: String,
    /// Restricts the scope to a single object name.
    pub name: Option<String>,
    /// Every label listed must match exactly.
    pub labels: BTreeMap<String, String>,
}

impl WatchScope {
    /// Scope covering every object of `kind` in `namespace`.
    #[must_use]
    pub fn namespace(kind: RequestKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: None,
            labels: BTreeMap::new(),
        }
    }

    /// Scope covering exactly one object.
    #[must_use]
    pub fn object(kind: RequestKind, key: &ObjectKey) -> Self {
        Self {
            kind,
            namespace: key.namespace().to_string(),
            name: Some(key.name().to_string()),
            labels: BTreeMap::new(),
        }
    }

    /// Adds a required label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns true if `object` falls inside the scope.
    #[must_use]
    pub fn matches(&self, object: &RequestObject) -> bool {
        let key = object.key();
        object.kind() == self.kind
            && key.namespace() == self.namespace
            && self.name.as_deref().is_none_or(|name| key.name() == name)
            && self
                .labels
                .iter()
                .all(|(k, v)| object.descriptor.labels().get(k) == Some(v))
    }
}

impl std::fmt::Display for WatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.namespace)?;
        if let Some(name) = &self.name {
            write!(f, "/{name}")?;
        }
        for (k, v) in &self.labels {
            write!(f, ",{k}={v}")?;
        }
        Ok(())
    }
}

/// Stream of watch notifications.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Access to control-plane request objects.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; one store is shared by every concurrent
/// wait in the process.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Stores a new request object.
    ///
    /// Returns [`CreateResult::AlreadyExists`] instead of an error when an
    /// object with the same kind and key is already present.
    async fn create(&self, descriptor: &RequestDescriptor) -> Result<CreateResult>;

    /// Gets a request object by key.
    ///
    /// Returns `None` if the object does not exist (or is not yet visible).
    async fn get(&self, kind: RequestKind, key: &ObjectKey) -> Result<Option<RequestObject>>;

    /// Lists every object in `scope`.
    async fn list(&self, scope: &WatchScope) -> Result<Vec<RequestObject>>;

    /// Opens a notification stream over `scope`.
    async fn watch(&self, scope: &WatchScope) -> Result<WatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestStatus, SourceReference};
    use chrono::Utc;
    use vsnap_core::ObjectUid;

    fn object(name: &str, labels: &[(&str, &str)]) -> RequestObject {
        let mut descriptor = RequestDescriptor::new(
            RequestKind::Upload,
            ObjectKey::new("velero", name).unwrap(),
            SourceReference::default(),
        );
        for (k, v) in labels {
            descriptor = descriptor.with_label(*k, *v);
        }
        RequestObject {
            descriptor,
            uid: ObjectUid::generate(),
            resource_version: 1,
            created_at: Utc::now(),
            status: RequestStatus::default(),
        }
    }

    #[test]
    fn scope_matches_kind_namespace_and_labels() {
        let scope = WatchScope::namespace(RequestKind::Upload, "velero")
            .with_label("vsnap.io/backup", "nightly");
        assert!(scope.matches(&object("u1", &[("vsnap.io/backup", "nightly")])));
        assert!(!scope.matches(&object("u2", &[("vsnap.io/backup", "weekly")])));
        assert!(!scope.matches(&object("u3", &[])));

        let other_kind = WatchScope::namespace(RequestKind::Clone, "velero");
        assert!(!other_kind.matches(&object("u1", &[])));
    }

    #[test]
    fn object_scope_matches_one_name() {
        let key = ObjectKey::new("velero", "u1").unwrap();
        let scope = WatchScope::object(RequestKind::Upload, &key);
        assert!(scope.matches(&object("u1", &[])));
        assert!(!scope.matches(&object("u2", &[])));
        assert_eq!(scope.to_string(), "Upload/velero/u1");
    }

    #[test]
    fn create_result_accessors() {
        let obj = object("u1", &[]);
        let created = CreateResult::Created(obj.clone());
        assert!(!created.already_existed());
        let existing = CreateResult::AlreadyExists(obj.clone());
        assert!(existing.already_existed());
        assert_eq!(existing.into_object(), obj);
    }
}
