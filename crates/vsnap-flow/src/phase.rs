//! Request phase state machine.
//!
//! Every tracked request kind reports a raw phase string owned by the
//! control plane. This module folds those vocabularies into one five-state
//! model:
//!
//! ```text
//! ┌─────────┐      ┌────────────┐      ┌───────────┐
//! │ PENDING │─────►│ IN_PROGRESS│─────►│ COMPLETED │
//! └─────────┘      └────────────┘  │   └───────────┘
//!      │                 │         │   ┌───────────┐
//!      └─────────────────┴─────────┼──►│  FAILED   │
//!                                  │   └───────────┘
//!                                  │   ┌───────────────────┐
//!                                  └──►│ FAILED_VALIDATION │
//!                                      └───────────────────┘
//! ```
//!
//! Transitions are driven by the control plane only. The engine observes
//! them, and [`PhaseTracker`] rejects anything that moves backwards or
//! leaves a terminal phase.

use serde::{Deserialize, Serialize};

/// The kind of tracked request, selecting its raw phase vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Clone a volume from a recorded snapshot (restore path).
    Clone,
    /// Upload a volume snapshot to the backup repository (backup path).
    Upload,
}

impl RequestKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Upload => "upload",
        }
    }

    /// Returns the control-plane resource kind.
    #[must_use]
    pub const fn resource_kind(&self) -> &'static str {
        match self {
            Self::Clone => "CloneFromSnapshot",
            Self::Upload => "Upload",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.resource_kind())
    }
}

/// Normalised request phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Accepted by the control plane, work not started.
    Pending,
    /// Work is underway.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Rejected by validation before any work started.
    FailedValidation,
}

impl Phase {
    /// All phases, in progression order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::FailedValidation,
    ];

    /// Returns true if no further transitions can occur.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedValidation
        )
    }

    /// Returns true only for [`Phase::Completed`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true for the two failure terminals.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::FailedValidation)
    }

    /// Position in the progression; every terminal phase shares the top rank.
    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed | Self::FailedValidation => 2,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedValidation => "failed_validation",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::FailedValidation => write!(f, "FailedValidation"),
        }
    }
}

/// Maps a raw phase to a [`Phase`], or `None` if the string is not part of
/// the vocabulary for `kind`.
#[must_use]
pub fn try_classify(kind: RequestKind, raw: &str) -> Option<Phase> {
    let canonical = match raw {
        "" | "New" | "Pending" => Some(Phase::Pending),
        "InProgress" => Some(Phase::InProgress),
        "Completed" => Some(Phase::Completed),
        "Failed" => Some(Phase::Failed),
        "FailedValidation" => Some(Phase::FailedValidation),
        _ => None,
    };
    if canonical.is_some() {
        return canonical;
    }

    match kind {
        RequestKind::Clone => None,
        RequestKind::Upload => match raw {
            "Canceling" | "Paused" => Some(Phase::InProgress),
            "UploadError" | "CleanupFailed" | "Canceled" => Some(Phase::Failed),
            _ => None,
        },
    }
}

/// Maps a raw phase to a [`Phase`].
///
/// Total: unrecognised strings classify as [`Phase::Failed`], since a phase
/// the engine does not understand cannot be assumed safe.
#[must_use]
pub fn classify(kind: RequestKind, raw: &str) -> Phase {
    try_classify(kind, raw).unwrap_or_else(|| {
        tracing::warn!(kind = kind.as_label(), raw_phase = raw, "unrecognised phase, treating as failed");
        Phase::Failed
    })
}

/// Returns true if `phase` is terminal.
#[must_use]
pub const fn is_terminal(phase: Phase) -> bool {
    phase.is_terminal()
}

/// Returns true if `phase` is the success terminal.
#[must_use]
pub const fn is_success(phase: Phase) -> bool {
    phase.is_success()
}

/// Outcome of feeding one observation into a [`PhaseTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observation for this object.
    Initial(Phase),
    /// The phase moved forward.
    Advanced {
        /// Previously observed phase.
        from: Phase,
        /// Newly observed phase.
        to: Phase,
    },
    /// Same phase as last time.
    Unchanged(Phase),
}

impl Transition {
    /// The phase after applying the observation.
    #[must_use]
    pub const fn current(&self) -> Phase {
        match self {
            Self::Initial(p) | Self::Unchanged(p) | Self::Advanced { to: p, .. } => *p,
        }
    }
}

/// A phase change that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("phase regressed from {from} to {to}")]
pub struct PhaseViolation {
    /// Previously observed phase.
    pub from: Phase,
    /// Offending observed phase.
    pub to: Phase,
}

/// Tracks the observed phase of one object and enforces monotonicity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTracker {
    current: Option<Phase>,
}

impl PhaseTracker {
    /// Creates a tracker with no observations.
    #[must_use]
    pub const fn new() -> Self {
        Self { current: None }
    }

    /// Returns the last accepted phase.
    #[must_use]
    pub const fn current(&self) -> Option<Phase> {
        self.current
    }

    /// Applies an observed phase.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseViolation`] if the phase moves to a lower rank, or
    /// changes after a terminal phase was observed.
    pub fn observe(&mut self, phase: Phase) -> Result<Transition, PhaseViolation> {
        let Some(from) = self.current else {
            self.current = Some(phase);
            return Ok(Transition::Initial(phase));
        };

        if from == phase {
            return Ok(Transition::Unchanged(phase));
        }
        if from.is_terminal() || phase.rank() < from.rank() {
            return Err(PhaseViolation { from, to: phase });
        }

        self.current = Some(phase);
        Ok(Transition::Advanced { from, to: phase })
    }
}
