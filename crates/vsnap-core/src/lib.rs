//! # vsnap-core
//!
//! Shared primitives for the vsnap volume snapshot extension.
//!
//! This crate provides the types used by every vsnap component:
//!
//! - **Identifiers**: `namespace/name` object keys and server-assigned uids
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialisation and span constructors
//! - **Configuration**: Environment variable helpers
//!
//! ## Example
//!
//! ```rust
//! use vsnap_core::prelude::*;
//!
//! let key = ObjectKey::new("velero", "upload-7d1c").unwrap();
//! assert_eq!(key.namespace(), "velero");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ObjectKey, ObjectUid};
    pub use crate::observability::{LogFormat, init_logging};
}

pub use error::{Error, Result};
pub use id::{ObjectKey, ObjectUid};
