//! Identity types for control-plane objects.
//!
//! Request objects are addressed the way the control plane addresses them:
//! by `namespace/name`. Names must be valid DNS-1123 subdomains so that a
//! name derived here is always accepted by the API server.
//!
//! # Example
//!
//! ```rust
//! use vsnap_core::id::ObjectKey;
//!
//! let key = ObjectKey::new("velero", "clone-3f2a").unwrap();
//! assert_eq!(key.to_string(), "velero/clone-3f2a");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum length of a DNS-1123 subdomain (object names).
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length of a DNS-1123 label (namespaces).
pub const MAX_NAMESPACE_LEN: usize = 63;

/// The `namespace/name` identity of a control-plane object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    namespace: String,
    name: String,
}

impl ObjectKey {
    /// Creates a key after validating both components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the namespace is not a DNS-1123 label
    /// or the name is not a DNS-1123 subdomain.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_namespace(&namespace)?;
        validate_name(&name)?;
        Ok(Self { namespace, name })
    }

    /// Returns the namespace component.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the name component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = s.split_once('/').ok_or_else(|| Error::InvalidId {
            message: format!("object key '{s}' must have the form namespace/name"),
        })?;
        Self::new(namespace, name)
    }
}

/// Server-assigned unique identifier of an object instance.
///
/// Two objects with the same [`ObjectKey`] but different uids are different
/// instances (the first was deleted and the name reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectUid(Ulid);

impl ObjectUid {
    /// Generates a new unique object uid.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ObjectUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_ascii_lowercase())
    }
}

/// Validates an object name (DNS-1123 subdomain).
///
/// # Errors
///
/// Returns [`Error::InvalidId`] describing the first violated rule.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId {
            message: format!("name '{name}' must be 1-{MAX_NAME_LEN} characters"),
        });
    }
    for label in name.split('.') {
        check_label(name, label)?;
    }
    Ok(())
}

/// Validates a namespace (DNS-1123 label).
///
/// # Errors
///
/// Returns [`Error::InvalidId`] describing the first violated rule.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(Error::InvalidId {
            message: format!("namespace '{namespace}' must be 1-{MAX_NAMESPACE_LEN} characters"),
        });
    }
    check_label(namespace, namespace)
}

fn check_label(whole: &str, label: &str) -> Result<()> {
    let bytes = label.as_bytes();
    let valid_chars = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    let valid_edges = bytes
        .first()
        .zip(bytes.last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if valid_chars && valid_edges {
        Ok(())
    } else {
        Err(Error::InvalidId {
            message: format!(
                "'{whole}' must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric"
            ),
        })
    }
}
