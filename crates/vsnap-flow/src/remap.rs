//! Namespace remapping of snapshot descriptors.
//!
//! A restore may move workloads to a different namespace. Every namespace
//! reference embedded in a [`SnapshotDescriptor`] is rewritten through the
//! mapping:
//!
//! - `metadata.namespace`
//! - `spec.resourceHandle.namespace`
//! - `metadata.namespace` inside the embedded manifest (`status.metadata`)
//!
//! References whose namespace is not in the mapping pass through unchanged,
//! and the input is never mutated. The embedded manifest is only required to
//! be JSON when the descriptor itself moves; otherwise an unreadable blob is
//! carried along as-is.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::snapshot::SnapshotDescriptor;

/// Source namespace to target namespace.
pub type NamespaceMapping = BTreeMap<String, String>;

/// Returns a copy of `snapshot` with namespaces rewritten through `mapping`.
///
/// # Errors
///
/// Returns [`Error::RemapFailure`] if the descriptor's namespace is mapped but
/// the embedded manifest is not a JSON object.
pub fn remap(snapshot: &SnapshotDescriptor, mapping: &NamespaceMapping) -> Result<SnapshotDescriptor> {
    let mut remapped = snapshot.clone();
    if mapping.is_empty() {
        return Ok(remapped);
    }

    let mut moved = false;
    if let Some(target) = mapping.get(&remapped.metadata.namespace) {
        remapped.metadata.namespace.clone_from(target);
        moved = true;
    }
    if let Some(namespace) = remapped.spec.resource_handle.namespace.as_mut() {
        if let Some(target) = mapping.get(namespace.as_str()) {
            namespace.clone_from(target);
            moved = true;
        }
    }
    if !remapped.status.metadata.is_empty() {
        if let Some(rewritten) = remap_manifest(&remapped.status.metadata, mapping, moved)? {
            remapped.status.metadata = rewritten;
        }
    }

    Ok(remapped)
}

/// Parses annotation text, remaps it, and serializes the result.
///
/// # Errors
///
/// Returns [`Error::RemapFailure`] if the text does not deserialize, the
/// manifest cannot be rewritten, or the result does not reserialize.
pub fn remap_annotation(text: &str, mapping: &NamespaceMapping) -> Result<String> {
    let snapshot = SnapshotDescriptor::from_annotation(text)?;
    remap(&snapshot, mapping)?.to_annotation()
}

/// Rewrites `metadata.namespace` in a serialized manifest.
///
/// Returns `None` when nothing needs to change so the original bytes are kept.
/// A manifest that is not a JSON object is an error only when `required`.
fn remap_manifest(
    manifest: &[u8],
    mapping: &NamespaceMapping,
    required: bool,
) -> Result<Option<Vec<u8>>> {
    let mut value = match serde_json::from_slice::<Value>(manifest) {
        Ok(value) if value.is_object() => value,
        Ok(_) if required => return Err(Error::remap("embedded manifest is not a JSON object")),
        Err(e) if required => {
            return Err(Error::remap(format!("embedded manifest is not JSON: {e}")));
        }
        Ok(_) | Err(_) => return Ok(None),
    };

    let Some(namespace) = value
        .pointer_mut("/metadata/namespace")
        .and_then(|ns| match ns {
            Value::String(s) => Some(s),
            _ => None,
        })
    else {
        return Ok(None);
    };
    let Some(target) = mapping.get(namespace.as_str()) else {
        return Ok(None);
    };
    namespace.clone_from(target);

    serde_json::to_vec(&value)
        .map(Some)
        .map_err(|e| Error::remap(format!("failed to serialize embedded manifest: {e}")))
}
