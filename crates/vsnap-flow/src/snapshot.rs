//! Snapshot descriptors recorded at backup time.
//!
//! A backed-up PVC carries its snapshot descriptor as JSON in the
//! [`SNAPSHOT_ANNOTATION`] annotation. The descriptor names the snapshot in
//! the backup repository and embeds the original claim manifest
//! (`status.metadata`, base64 on the wire) that the clone request uses to
//! recreate the volume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// PVC annotation holding the serialized [`SnapshotDescriptor`].
pub const SNAPSHOT_ANNOTATION: &str = "vsnap.io/snapshot";

/// Object metadata of a snapshot descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// Snapshot object name.
    pub name: String,
    /// Namespace the snapshot (and its source claim) lived in.
    pub namespace: String,
    /// Labels copied from the snapshot object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Reference to the object that was snapshotted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHandle {
    /// API group of the snapshotted object; empty for the core group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the snapshotted object.
    pub kind: String,
    /// Name of the snapshotted object.
    pub name: String,
    /// Namespace of the snapshotted object, when it is namespaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Desired state recorded for the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// The snapshotted object.
    pub resource_handle: ResourceHandle,
    /// Name of the backup repository holding the snapshot data.
    #[serde(default)]
    pub backup_repository: String,
}

/// Observed state recorded for the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    /// Snapshot phase at backup time.
    #[serde(default)]
    pub phase: String,
    /// Identifier of the snapshot in the backup repository.
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
    /// Serialized manifest of the snapshotted object.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<u8>,
}

/// A previously recorded volume snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDescriptor {
    /// Object metadata.
    pub metadata: SnapshotMeta,
    /// Desired state.
    pub spec: SnapshotSpec,
    /// Observed state.
    pub status: SnapshotStatus,
}

impl SnapshotDescriptor {
    /// Parses a descriptor from annotation text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemapFailure`] if the text is not a descriptor.
    pub fn from_annotation(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::remap(format!("snapshot annotation is not a descriptor: {e}")))
    }

    /// Serializes the descriptor to annotation text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemapFailure`] if serialization fails.
    pub fn to_annotation(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::remap(format!("failed to serialize snapshot descriptor: {e}")))
    }

    /// Returns the snapshot identifier in the backup repository.
    #[must_use]
    pub fn snapshot_id(&self) -> &str {
        &self.status.snapshot_id
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
