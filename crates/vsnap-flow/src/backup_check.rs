//! Confirm that every snapshot upload of a backup finished.
//!
//! Upload requests created for a backup carry [`BACKUP_OWNER_LABEL`] with the
//! backup name. [`BackupUploadCheck::verify`] aggregates exactly those
//! requests and turns anything short of full success into an error.

use std::sync::Arc;
use std::time::Duration;

use vsnap_core::ObjectKey;

use crate::aggregate::CompletionAggregator;
use crate::config::ObservationConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::phase::{Phase, RequestKind};
use crate::request::{AggregateOutcome, FailureCause, RequestDescriptor, SourceReference};
use crate::store::RequestStore;

/// Label naming the backup an upload belongs to.
pub const BACKUP_OWNER_LABEL: &str = "vsnap.io/backup";

/// Verifies backup uploads in the plugin namespace.
#[derive(Clone)]
pub struct BackupUploadCheck {
    store: Arc<dyn RequestStore>,
    namespace: String,
    deadline: Duration,
    config: ObservationConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for BackupUploadCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupUploadCheck")
            .field("namespace", &self.namespace)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl BackupUploadCheck {
    /// Creates a check over Upload requests in `namespace`.
    #[must_use]
    pub fn new(
        store: Arc<dyn RequestStore>,
        namespace: impl Into<String>,
        deadline: Duration,
        config: ObservationConfig,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            deadline,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Uses `metrics` instead of a private recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FlowMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds an Upload request owned by `backup_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid object name.
    pub fn upload_request(
        &self,
        backup_name: &str,
        name: &str,
        source: SourceReference,
    ) -> Result<RequestDescriptor> {
        let key = ObjectKey::new(self.namespace.clone(), name)?;
        Ok(RequestDescriptor::new(RequestKind::Upload, key, source)
            .with_label(BACKUP_OWNER_LABEL, backup_name))
    }

    /// Waits for the `expected_uploads` uploads of `backup_name` to complete.
    ///
    /// # Errors
    ///
    /// - [`Error::TerminalFailure`] naming the first upload that failed or
    ///   was deleted
    /// - [`Error::Timeout`] stating how many uploads completed
    /// - any error of [`CompletionAggregator::await_all`]
    pub async fn verify(&self, backup_name: &str, expected_uploads: usize) -> Result<AggregateOutcome> {
        if backup_name.is_empty() {
            return Err(Error::InvalidInput("backup name is empty".to_string()));
        }
        tracing::info!(backup = backup_name, expected_uploads, "verifying snapshot uploads");

        let outcome = CompletionAggregator::new(
            Arc::clone(&self.store),
            self.namespace.clone(),
            self.config,
        )
        .with_label(BACKUP_OWNER_LABEL, backup_name)
        .with_metrics(self.metrics.clone())
        .await_all(RequestKind::Upload, expected_uploads, self.deadline)
        .await?;

        let Some(failure) = outcome.first_failure.clone() else {
            return Ok(outcome);
        };
        Err(match failure.cause {
            FailureCause::Timeout => Error::Timeout {
                target: format!("uploads of backup {backup_name}"),
                waited: self.deadline,
                message: failure.message,
            },
            FailureCause::ControlPlane | FailureCause::Unaccepted | FailureCause::Deleted => {
                Error::TerminalFailure {
                    key: failure
                        .key
                        .map_or_else(|| backup_name.to_string(), |k| k.to_string()),
                    phase: failure.phase.unwrap_or(Phase::Failed),
                    message: failure.message,
                }
            }
        })
    }
}
