//! Error types and result aliases for vsnap.
//!
//! This module defines the shared error types used by every vsnap crate.
//! Engine-specific failures (submission, observation, timeouts) live in
//! `vsnap-flow` and wrap this type when a shared primitive fails.

use std::fmt;

/// The result type used throughout vsnap.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared vsnap operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid object name or identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The requested object was not found.
    #[error("not found: {resource_type} {key}")]
    ResourceNotFound {
        /// The kind of object that was looked up.
        resource_type: &'static str,
        /// The `namespace/name` key that was looked up.
        key: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, key: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            key: key.to_string(),
        }
    }
}
