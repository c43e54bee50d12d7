//! Restore a volume from a recorded snapshot.
//!
//! [`CloneOrchestrator::restore_from_snapshot`] turns "restore this claim
//! from snapshot S" into a Clone request, waits for it, and returns the
//! handle of the materialized volume.
//!
//! Clone request names are derived from the snapshot id and the target
//! claim, so restarting a restore resubmits the same object instead of
//! provisioning a second volume.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use vsnap_core::ObjectKey;

use crate::error::{Error, Result};
use crate::phase::{Phase, RequestKind};
use crate::remap::{NamespaceMapping, remap};
use crate::request::{FailureCause, RequestDescriptor, SourceReference};
use crate::snapshot::SnapshotDescriptor;
use crate::waiter::TerminalWaiter;

/// Prefix of clone request names.
pub const CLONE_NAME_PREFIX: &str = "clone-";

/// Label recording the namespace the snapshot was taken in.
pub const SOURCE_NAMESPACE_LABEL: &str = "vsnap.io/source-namespace";

/// Phases a clone wait accepts.
pub const CLONE_ACCEPTED_PHASES: [Phase; 2] = [Phase::Completed, Phase::Failed];

const NAME_HASH_LEN: usize = 20;

/// Restores volumes from snapshots through Clone requests.
#[derive(Debug, Clone)]
pub struct CloneOrchestrator {
    waiter: TerminalWaiter,
    deadline: Duration,
}

impl CloneOrchestrator {
    /// Creates an orchestrator that waits at most `deadline` per clone.
    #[must_use]
    pub const fn new(waiter: TerminalWaiter, deadline: Duration) -> Self {
        Self { waiter, deadline }
    }

    /// Returns the per-clone deadline.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Clones `snapshot` into the namespace `original_namespace` maps to and
    /// returns the handle of the new volume.
    ///
    /// # Errors
    ///
    /// - [`Error::RemapFailure`] if the snapshot cannot be remapped
    /// - [`Error::SubmissionFailure`] if the clone request is rejected
    /// - [`Error::TerminalFailure`] with the control-plane message verbatim
    ///   if the clone fails
    /// - [`Error::Timeout`] if the clone does not finish within the deadline
    /// - [`Error::ProtocolViolation`] if the clone completes without a handle
    pub async fn restore_from_snapshot(
        &self,
        snapshot: &SnapshotDescriptor,
        original_namespace: &str,
        mapping: &NamespaceMapping,
    ) -> Result<String> {
        self.restore_from_snapshot_cancellable(
            snapshot,
            original_namespace,
            mapping,
            &CancellationToken::new(),
        )
        .await
    }

    /// Like [`restore_from_snapshot`](Self::restore_from_snapshot), but also
    /// stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`restore_from_snapshot`](Self::restore_from_snapshot), plus
    /// [`Error::Cancelled`].
    pub async fn restore_from_snapshot_cancellable(
        &self,
        snapshot: &SnapshotDescriptor,
        original_namespace: &str,
        mapping: &NamespaceMapping,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = build_clone_request(snapshot, original_namespace, mapping)?;
        let key = request.key().to_string();
        tracing::info!(
            request = %key,
            snapshot_id = snapshot.snapshot_id(),
            "restoring volume from snapshot"
        );

        let outcome = self
            .waiter
            .submit_and_wait_cancellable(&request, &CLONE_ACCEPTED_PHASES, self.deadline, cancel)
            .await?;

        if let Some(failure) = outcome.failure {
            return Err(match failure.cause {
                FailureCause::Timeout => Error::Timeout {
                    target: key,
                    waited: self.deadline,
                    message: failure.message,
                },
                FailureCause::ControlPlane | FailureCause::Unaccepted | FailureCause::Deleted => {
                    Error::TerminalFailure {
                        key,
                        phase: outcome.final_phase,
                        message: failure.message,
                    }
                }
            });
        }

        outcome.result_handle.ok_or_else(|| Error::ProtocolViolation {
            key,
            message: "clone completed without a result handle".to_string(),
        })
    }
}

/// Builds the Clone request for restoring `snapshot`.
///
/// The snapshot is remapped only when `mapping` names `original_namespace`;
/// the request is created in the namespace the claim is restored into.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the snapshot has no id or claim name,
/// and [`Error::RemapFailure`] if remapping fails.
pub fn build_clone_request(
    snapshot: &SnapshotDescriptor,
    original_namespace: &str,
    mapping: &NamespaceMapping,
) -> Result<RequestDescriptor> {
    if snapshot.snapshot_id().is_empty() {
        return Err(Error::InvalidInput("snapshot has no snapshot id".to_string()));
    }
    let claim = &snapshot.spec.resource_handle.name;
    if claim.is_empty() {
        return Err(Error::InvalidInput(
            "snapshot resource handle has no name".to_string(),
        ));
    }

    let (snapshot, target_namespace) = match mapping.get(original_namespace) {
        Some(target) => (remap(snapshot, mapping)?, target.as_str()),
        None => (snapshot.clone(), original_namespace),
    };

    let name = clone_request_name(snapshot.snapshot_id(), target_namespace, claim);
    let key = ObjectKey::new(target_namespace, name)?;
    let source = SourceReference {
        snapshot_id: snapshot.status.snapshot_id,
        api_group: snapshot.spec.resource_handle.api_group,
        kind: snapshot.spec.resource_handle.kind,
        backup_repository: snapshot.spec.backup_repository,
        metadata: snapshot.status.metadata,
    };

    Ok(RequestDescriptor::new(RequestKind::Clone, key, source)
        .with_label(SOURCE_NAMESPACE_LABEL, original_namespace))
}

/// Derives the Clone request name for a snapshot and target claim.
#[must_use]
pub fn clone_request_name(snapshot_id: &str, target_namespace: &str, claim: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [snapshot_id, target_namespace, claim] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{CLONE_NAME_PREFIX}{}", &digest[..NAME_HASH_LEN])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::snapshot::{ResourceHandle, SnapshotMeta, SnapshotSpec, SnapshotStatus};

    fn snapshot() -> SnapshotDescriptor {
        SnapshotDescriptor {
            metadata: SnapshotMeta {
                name: "snap-data-0".into(),
                namespace: "demo-app".into(),
                labels: BTreeMap::new(),
            },
            spec: SnapshotSpec {
                resource_handle: ResourceHandle {
                    api_group: None,
                    kind: "PersistentVolumeClaim".into(),
                    name: "data-0".into(),
                    namespace: Some("demo-app".into()),
                },
                backup_repository: "br-default".into(),
            },
            status: SnapshotStatus {
                phase: "Uploaded".into(),
                snapshot_id: "snap-123".into(),
                metadata: br#"{"metadata":{"name":"data-0","namespace":"demo-app"}}"#.to_vec(),
            },
        }
    }

    #[test]
    fn request_names_are_deterministic_dns_labels() {
        let a = clone_request_name("snap-123", "demo", "data-0");
        let b = clone_request_name("snap-123", "demo", "data-0");
        let c = clone_request_name("snap-123", "other", "data-0");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), CLONE_NAME_PREFIX.len() + NAME_HASH_LEN);
        vsnap_core::id::validate_name(&a).unwrap();
    }

    #[test]
    fn unmapped_namespace_clones_in_place() {
        let request = build_clone_request(&snapshot(), "demo-app", &NamespaceMapping::new()).unwrap();
        assert_eq!(request.target_namespace(), "demo-app");
        assert_eq!(request.kind(), RequestKind::Clone);
        assert_eq!(request.source().snapshot_id, "snap-123");
        assert_eq!(request.source().backup_repository, "br-default");
        assert_eq!(
            request.labels().get(SOURCE_NAMESPACE_LABEL).map(String::as_str),
            Some("demo-app")
        );
    }

    #[test]
    fn mapped_namespace_remaps_the_manifest() {
        let mut mapping = NamespaceMapping::new();
        mapping.insert("demo-app".into(), "demo-restore".into());
        let request = build_clone_request(&snapshot(), "demo-app", &mapping).unwrap();
        assert_eq!(request.target_namespace(), "demo-restore");
        let manifest: serde_json::Value =
            serde_json::from_slice(&request.source().metadata).unwrap();
        assert_eq!(manifest["metadata"]["namespace"], "demo-restore");
    }

    #[test]
    fn missing_snapshot_id_is_rejected() {
        let mut snapshot = snapshot();
        snapshot.status.snapshot_id.clear();
        let err = build_clone_request(&snapshot, "demo-app", &NamespaceMapping::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
