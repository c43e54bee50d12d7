//! Observability infrastructure for vsnap.
//!
//! Structured logging with consistent spans. Every wait on a control-plane
//! request runs inside a [`request_span`] so that log lines from concurrent
//! restores can be told apart.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::env_string;
use crate::error::{Error, Result};

static INIT: Once = Once::new();

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "VSNAP_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`, case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for any other value.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else if value.eq_ignore_ascii_case("pretty") {
            Ok(Self::Pretty)
        } else {
            Err(Error::configuration(format!(
                "{LOG_FORMAT_ENV} must be 'json' or 'pretty', got '{value}'"
            )))
        }
    }

    /// Reads the format from `VSNAP_LOG_FORMAT`; unset means pretty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the variable holds an unknown format.
    pub fn from_env() -> Result<Self> {
        env_string(LOG_FORMAT_ENV).map_or(Ok(Self::Pretty), |value| Self::parse(&value))
    }
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `vsnap_flow=debug`)
///
/// # Example
///
/// ```rust
/// use vsnap_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        if let Err(e) = result {
            // Another subscriber was installed first (common in tests).
            tracing::debug!(error = %e, "global subscriber already set");
        }
    });
}

/// Creates a span for a single tracked request.
///
/// # Example
///
/// ```rust
/// use vsnap_core::observability::request_span;
///
/// let span = request_span("submit_and_wait", "clone", "velero", "clone-3f2a");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn request_span(operation: &str, kind: &str, namespace: &str, name: &str) -> Span {
    tracing::info_span!(
        "request",
        op = operation,
        kind = kind,
        namespace = namespace,
        name = name,
    )
}

/// Creates a span for an aggregate wait over many requests.
#[must_use]
pub fn aggregate_span(kind: &str, namespace: &str, expected: usize) -> Span {
    tracing::info_span!(
        "aggregate",
        kind = kind,
        namespace = namespace,
        expected = expected,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn parses_log_format() {
        assert_eq!(LogFormat::parse("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse(" json ").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("Pretty").unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn unknown_log_format_is_a_configuration_error() {
        let err = LogFormat::parse("text").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains(LOG_FORMAT_ENV));
    }

    #[test]
    fn request_span_creates_span() {
        let span = request_span("submit_and_wait", "upload", "velero", "upload-1");
        let _guard = span.enter();
        tracing::info!("request message");
    }
}
