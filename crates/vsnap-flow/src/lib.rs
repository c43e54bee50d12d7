//! # vsnap-flow
//!
//! Request lifecycle tracking for the vsnap volume snapshot extension.
//!
//! Restores and backups both hand work to a slow, eventually-consistent
//! control plane as declarative request objects that move through phases on
//! their own. This crate submits those requests and decides when they are
//! done:
//!
//! - **Phase model**: one terminal-state machine shared by Clone and Upload
//!   requests, fail-closed on unknown phases
//! - **Single waits**: submit a request and block until it reaches a
//!   terminal phase, merging watch notifications with a safety-net poll
//! - **Aggregate waits**: decide when N independent requests all completed
//!   or any failed
//! - **Restore and backup hooks**: clone claims from snapshots, verify that
//!   a backup's uploads finished
//!
//! ## Guarantees
//!
//! - **Idempotent**: resubmitting a request reuses the existing object
//! - **Monotonic**: phase regressions surface as protocol violations
//! - **Bounded**: every wait ends at its deadline with a distinguishable
//!   timeout outcome
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use vsnap_flow::clone::CloneOrchestrator;
//! use vsnap_flow::config::EngineConfig;
//! use vsnap_flow::error::Result;
//! use vsnap_flow::snapshot::SnapshotDescriptor;
//! use vsnap_flow::store::memory::InMemoryRequestStore;
//! use vsnap_flow::waiter::TerminalWaiter;
//!
//! # async fn restore(annotation: &str) -> Result<String> {
//! let config = EngineConfig::from_env()?;
//! let store = Arc::new(InMemoryRequestStore::new());
//! let waiter = TerminalWaiter::new(store, config.observation);
//! let orchestrator = CloneOrchestrator::new(waiter, config.clone_timeout);
//!
//! let snapshot = SnapshotDescriptor::from_annotation(annotation)?;
//! orchestrator
//!     .restore_from_snapshot(&snapshot, "demo-app", &BTreeMap::new())
//!     .await
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod observe;

pub mod aggregate;
pub mod backup_check;
pub mod clone;
pub mod config;
pub mod error;
pub mod metrics;
pub mod phase;
pub mod remap;
pub mod request;
pub mod restore_action;
pub mod snapshot;
pub mod store;
pub mod waiter;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregate::CompletionAggregator;
    pub use crate::backup_check::{BACKUP_OWNER_LABEL, BackupUploadCheck};
    pub use crate::clone::CloneOrchestrator;
    pub use crate::config::{EngineConfig, ObservationConfig};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::FlowMetrics;
    pub use crate::phase::{Phase, PhaseTracker, RequestKind, classify, is_success, is_terminal};
    pub use crate::remap::{NamespaceMapping, remap};
    pub use crate::request::{
        AggregateFailure, AggregateOutcome, FailureCause, RequestDescriptor, RequestObject,
        RequestStatus, SourceReference, WaitFailure, WaitOutcome,
    };
    pub use crate::restore_action::{PvcRestoreAction, RestoreItemInput, RestoreItemOutput};
    pub use crate::snapshot::{SNAPSHOT_ANNOTATION, SnapshotDescriptor};
    pub use crate::store::{CreateResult, RequestStore, WatchEvent, WatchEventType, WatchScope};
    pub use crate::waiter::TerminalWaiter;
}
