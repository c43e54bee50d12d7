//! Restore item action for persistent volume claims.
//!
//! Claims backed up through a volume snapshot carry the snapshot descriptor
//! in the [`SNAPSHOT_ANNOTATION`] annotation. For those claims the action
//! clones the volume from the snapshot and tells the host to skip creating
//! the claim itself; every other claim passes through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clone::CloneOrchestrator;
use crate::error::{Error, Result};
use crate::remap::NamespaceMapping;
use crate::snapshot::{SNAPSHOT_ANNOTATION, SnapshotDescriptor};

/// Resource name the action applies to.
pub const PVC_RESOURCE: &str = "persistentvolumeclaims";

/// Annotation recording the handle of the restored volume.
pub const RESTORED_HANDLE_ANNOTATION: &str = "vsnap.io/restored-handle";

/// Resources an action wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// Resource names, lowercase plural.
    pub included_resources: Vec<String>,
}

/// One item handed to the action during a restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreItemInput {
    /// The item manifest from the backup.
    pub item: Value,
    /// The restore's namespace mapping.
    pub namespace_mapping: NamespaceMapping,
}

/// What the host should do with the item.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreItemOutput {
    /// Manifest to restore (or record, when skipped).
    pub updated_item: Value,
    /// The host must not create the item; the action already materialized it.
    pub skip_restore: bool,
    /// Handle of the restored volume, when one was produced.
    pub resource_handle: Option<String>,
}

impl RestoreItemOutput {
    fn unchanged(item: Value) -> Self {
        Self {
            updated_item: item,
            skip_restore: false,
            resource_handle: None,
        }
    }
}

/// Restores snapshot-backed claims by cloning them.
#[derive(Debug, Clone)]
pub struct PvcRestoreAction {
    orchestrator: CloneOrchestrator,
}

impl PvcRestoreAction {
    /// Creates the action.
    #[must_use]
    pub const fn new(orchestrator: CloneOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Returns the resources the action applies to.
    #[must_use]
    pub fn applies_to(&self) -> ResourceSelector {
        ResourceSelector {
            included_resources: vec![PVC_RESOURCE.to_string()],
        }
    }

    /// Restores one claim.
    ///
    /// # Errors
    ///
    /// - [`Error::RemapFailure`] if the snapshot annotation is malformed
    /// - [`Error::InvalidInput`] if the item has no usable namespace
    /// - any error of [`CloneOrchestrator::restore_from_snapshot`]
    pub async fn execute(&self, input: RestoreItemInput) -> Result<RestoreItemOutput> {
        let RestoreItemInput {
            item,
            namespace_mapping,
        } = input;

        let Some(text) = annotation(&item, SNAPSHOT_ANNOTATION).map(str::to_owned) else {
            tracing::debug!("claim has no snapshot annotation, restoring as-is");
            return Ok(RestoreItemOutput::unchanged(item));
        };
        let snapshot = SnapshotDescriptor::from_annotation(&text)?;

        let original_namespace = item
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(snapshot.metadata.namespace.as_str())
            .to_string();
        if original_namespace.is_empty() {
            return Err(Error::InvalidInput(
                "claim and snapshot both lack a namespace".to_string(),
            ));
        }

        let handle = self
            .orchestrator
            .restore_from_snapshot(&snapshot, &original_namespace, &namespace_mapping)
            .await?;
        tracing::info!(handle = %handle, namespace = %original_namespace, "claim restored from snapshot");

        let mut updated_item = item;
        if let Some(annotations) = updated_item
            .pointer_mut("/metadata/annotations")
            .and_then(Value::as_object_mut)
        {
            annotations.insert(
                RESTORED_HANDLE_ANNOTATION.to_string(),
                Value::String(handle.clone()),
            );
        }

        Ok(RestoreItemOutput {
            updated_item,
            skip_restore: true,
            resource_handle: Some(handle),
        })
    }
}

fn annotation<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get("metadata")?
        .get("annotations")?
        .get(key)?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_lookup_handles_slashes() {
        let item = serde_json::json!({
            "metadata": {"annotations": {"vsnap.io/snapshot": "{}"}}
        });
        assert_eq!(annotation(&item, SNAPSHOT_ANNOTATION), Some("{}"));
        assert_eq!(annotation(&serde_json::json!({}), SNAPSHOT_ANNOTATION), None);
    }
}
