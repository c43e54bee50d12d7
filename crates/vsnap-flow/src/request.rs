//! Request objects and the outcomes of tracking them.
//!
//! This module provides:
//! - `RequestDescriptor`: what the engine submits (immutable)
//! - `RequestObject`: what the control plane stores and reports back
//! - `WaitOutcome`: the result of tracking one request to a terminal phase
//! - `AggregateOutcome`: the verdict over a population of requests

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vsnap_core::{ObjectKey, ObjectUid};

use crate::phase::{Phase, RequestKind, classify};

/// Reference to the prior recorded state a request works from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// Snapshot identifier in the backup repository.
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
    /// API group of the object to materialize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the object to materialize.
    pub kind: String,
    /// Backup repository holding the snapshot data.
    #[serde(default)]
    pub backup_repository: String,
    /// Serialized manifest of the object to materialize.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<u8>,
}

/// Immutable specification of a unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    key: ObjectKey,
    kind: RequestKind,
    source: SourceReference,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

impl RequestDescriptor {
    /// Creates a descriptor for `kind` named `key`.
    #[must_use]
    pub fn new(kind: RequestKind, key: ObjectKey, source: SourceReference) -> Self {
        Self {
            key,
            kind,
            source,
            labels: BTreeMap::new(),
        }
    }

    /// Adds a label to the descriptor.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns the object identity.
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Returns the namespace the request is created in.
    #[must_use]
    pub fn target_namespace(&self) -> &str {
        self.key.namespace()
    }

    /// Returns the request kind.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns the source reference.
    #[must_use]
    pub fn source(&self) -> &SourceReference {
        &self.source
    }

    /// Returns the labels.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

/// Status reported by the control plane. The engine never writes it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    /// Raw phase in the vocabulary of the request kind.
    #[serde(default)]
    pub phase: String,
    /// Human-readable status message.
    #[serde(default)]
    pub message: String,
    /// Handle of the produced resource; set only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_handle: Option<String>,
}

/// A request object as stored by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestObject {
    /// The submitted specification.
    pub descriptor: RequestDescriptor,
    /// Server-assigned instance identifier.
    pub uid: ObjectUid,
    /// Monotonic version, bumped on every write.
    pub resource_version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Current status.
    #[serde(default)]
    pub status: RequestStatus,
}

impl RequestObject {
    /// Returns the object identity.
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        self.descriptor.key()
    }

    /// Returns the request kind.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.descriptor.kind()
    }

    /// Classifies the current raw phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        classify(self.kind(), &self.status.phase)
    }
}

/// Why a wait ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The control plane reported a failure phase.
    ControlPlane,
    /// A terminal phase outside the caller's accepted set was reached.
    Unaccepted,
    /// The object was deleted before reaching a terminal phase.
    Deleted,
    /// The deadline elapsed.
    Timeout,
}

impl FailureCause {
    /// Returns a lowercase label suitable for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::ControlPlane => "control_plane",
            Self::Unaccepted => "unaccepted",
            Self::Deleted => "deleted",
            Self::Timeout => "timeout",
        }
    }
}

/// Failure detail of a [`WaitOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitFailure {
    /// Failure classification.
    pub cause: FailureCause,
    /// Control-plane message (verbatim) or a synthesized description.
    pub message: String,
}

/// Result of tracking one request to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    /// The tracked request.
    pub key: ObjectKey,
    /// Last phase observed; `Failed` for synthesized timeouts.
    pub final_phase: Phase,
    /// Produced resource handle on success.
    pub result_handle: Option<String>,
    /// Failure detail when the wait did not succeed.
    pub failure: Option<WaitFailure>,
    /// Time spent waiting.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl WaitOutcome {
    /// Returns true if the request reached an accepted phase without failure.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Returns true if the wait ended because the deadline elapsed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.cause == FailureCause::Timeout)
    }

    /// Returns the failure message, if any.
    #[must_use]
    pub fn failure_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }
}

/// Why an aggregate wait failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateFailure {
    /// The request that failed; `None` for timeouts.
    pub key: Option<ObjectKey>,
    /// Failure classification.
    pub cause: FailureCause,
    /// Phase of the failing request, when one was observed.
    pub phase: Option<Phase>,
    /// Control-plane message (verbatim) or a synthesized description.
    pub message: String,
}

/// Verdict over a population of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOutcome {
    /// Requests observed in the success phase.
    pub succeeded_count: usize,
    /// Requests the caller expected.
    pub expected_count: usize,
    /// First failure observed, if any.
    pub first_failure: Option<AggregateFailure>,
}

impl AggregateOutcome {
    /// Returns true if every expected request completed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.first_failure.is_none() && self.succeeded_count >= self.expected_count
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
