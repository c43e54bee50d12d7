//! Error types for request lifecycle tracking.
//!
//! The variants follow how a failure should be handled by the caller:
//!
//! | Variant | Retried by the engine | Caller guidance |
//! |---------|-----------------------|-----------------|
//! | `SubmissionFailure` | no | surface to the operator |
//! | `RemapFailure` | no | fail this restore item only |
//! | `ObservationFailure` | yes, until the poll budget is spent | transport is down |
//! | `TerminalFailure` | no | message is operator-facing, show verbatim |
//! | `Timeout` | no | may re-poll later or give up |
//! | `ProtocolViolation` | no | control plane broke phase monotonicity |

use std::time::Duration;

use crate::phase::Phase;

/// The result type used throughout vsnap-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while submitting or tracking requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The control plane rejected the request object.
    #[error("failed to submit {key}: {message}")]
    SubmissionFailure {
        /// `namespace/name` of the request.
        key: String,
        /// Description of the rejection.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A snapshot descriptor could not be deserialized or reserialized.
    #[error("failed to remap snapshot descriptor: {message}")]
    RemapFailure {
        /// Description of the malformed content.
        message: String,
    },

    /// Neither notifications nor polling could observe the request.
    #[error("lost observation of {target} after {attempts} failed polls: {message}")]
    ObservationFailure {
        /// The object key or watch scope being observed.
        target: String,
        /// Consecutive failed poll attempts.
        attempts: u32,
        /// Last transport error.
        message: String,
    },

    /// The control plane reported a failure phase.
    #[error("{key} finished with phase {phase}: {message}")]
    TerminalFailure {
        /// `namespace/name` of the request.
        key: String,
        /// The failure phase observed.
        phase: Phase,
        /// Control-plane status message, unmodified.
        message: String,
    },

    /// The deadline elapsed before a terminal phase was observed.
    #[error("timed out after {waited:?} waiting for {target}: {message}")]
    Timeout {
        /// What was being waited on.
        target: String,
        /// The deadline that elapsed.
        waited: Duration,
        /// Progress description at the time of the timeout.
        message: String,
    },

    /// The control plane reported a phase change the state machine forbids.
    #[error("protocol violation on {key}: {message}")]
    ProtocolViolation {
        /// `namespace/name` of the request.
        key: String,
        /// Description of the violation.
        message: String,
    },

    /// The caller cancelled the wait.
    #[error("wait for {target} was cancelled")]
    Cancelled {
        /// What was being waited on.
        target: String,
    },

    /// A request store operation failed.
    #[error("request store error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An invalid argument was supplied.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An error from vsnap-core.
    #[error("core error: {0}")]
    Core(#[from] vsnap_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new remap failure.
    #[must_use]
    pub fn remap(message: impl Into<String>) -> Self {
        Self::RemapFailure {
            message: message.into(),
        }
    }

    /// Returns true if this error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the control plane reported the failure.
    #[must_use]
    pub const fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::TerminalFailure { .. })
    }

    /// Returns a lowercase label suitable for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::SubmissionFailure { .. } => "submission",
            Self::RemapFailure { .. } => "remap",
            Self::ObservationFailure { .. } => "observation",
            Self::TerminalFailure { .. } => "terminal",
            Self::Timeout { .. } => "timeout",
            Self::ProtocolViolation { .. } => "protocol",
            Self::Cancelled { .. } => "cancelled",
            Self::Storage { .. } => "storage",
            Self::InvalidInput(_) => "invalid_input",
            Self::Core(_) => "core",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_failure_keeps_message_verbatim() {
        let err = Error::TerminalFailure {
            key: "demo/clone-1".into(),
            phase: Phase::Failed,
            message: "Volume quota exceeded on datastore ds-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Volume quota exceeded on datastore ds-1"));
        assert!(msg.contains("Failed"));
        assert!(err.is_terminal_failure());
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_is_distinguishable() {
        let err = Error::Timeout {
            target: "demo/clone-1".into(),
            waited: Duration::from_secs(600),
            message: "last observed phase InProgress".into(),
        };
        assert!(err.is_timeout());
        assert!(!err.is_terminal_failure());
        assert_eq!(err.as_label(), "timeout");
    }

    #[test]
    fn core_errors_convert() {
        let err: Error = vsnap_core::Error::InvalidInput("bad".into()).into();
        assert_eq!(err.as_label(), "core");
    }
}
