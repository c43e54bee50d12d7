//! Engine configuration.
//!
//! Values come from defaults overridden by `VSNAP_*` environment variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `VSNAP_POLL_INTERVAL_MS` | 1000 |
//! | `VSNAP_POLL_RETRY_BUDGET` | 5 |
//! | `VSNAP_CLONE_TIMEOUT_SECS` | 600 |
//! | `VSNAP_UPLOAD_TIMEOUT_SECS` | 600 |
//! | `VSNAP_LOG_FORMAT` | pretty |

use std::time::Duration;

use vsnap_core::config::{env_duration_millis, env_duration_secs, env_u32};
use vsnap_core::observability::LogFormat;

use crate::error::{Error, Result};

/// Poll interval variable.
pub const POLL_INTERVAL_ENV: &str = "VSNAP_POLL_INTERVAL_MS";
/// Poll retry budget variable.
pub const POLL_RETRY_BUDGET_ENV: &str = "VSNAP_POLL_RETRY_BUDGET";
/// Clone deadline variable.
pub const CLONE_TIMEOUT_ENV: &str = "VSNAP_CLONE_TIMEOUT_SECS";
/// Upload aggregate deadline variable.
pub const UPLOAD_TIMEOUT_ENV: &str = "VSNAP_UPLOAD_TIMEOUT_SECS";

/// Default interval between safety-net polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of consecutive poll failures tolerated.
pub const DEFAULT_POLL_RETRY_BUDGET: u32 = 5;
/// Default deadline for a clone request.
pub const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default deadline for all uploads of a backup.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// How a single observation source polls and tolerates failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationConfig {
    /// Interval between polls.
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated while the watch is down.
    pub poll_retry_budget: u32,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_retry_budget: DEFAULT_POLL_RETRY_BUDGET,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Polling behaviour shared by every wait.
    pub observation: ObservationConfig,
    /// Deadline for one clone request.
    pub clone_timeout: Duration,
    /// Deadline for all uploads of one backup.
    pub upload_timeout: Duration,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            observation: ObservationConfig::default(),
            clone_timeout: DEFAULT_CLONE_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or zero.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            observation: ObservationConfig {
                poll_interval: env_duration_millis(POLL_INTERVAL_ENV)?
                    .unwrap_or(defaults.observation.poll_interval),
                poll_retry_budget: env_u32(POLL_RETRY_BUDGET_ENV)?
                    .unwrap_or(defaults.observation.poll_retry_budget),
            },
            clone_timeout: env_duration_secs(CLONE_TIMEOUT_ENV)?
                .unwrap_or(defaults.clone_timeout),
            upload_timeout: env_duration_secs(UPLOAD_TIMEOUT_ENV)?
                .unwrap_or(defaults.upload_timeout),
            log_format: LogFormat::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that every duration is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] wrapping a configuration error.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            (POLL_INTERVAL_ENV, self.observation.poll_interval),
            (CLONE_TIMEOUT_ENV, self.clone_timeout),
            (UPLOAD_TIMEOUT_ENV, self.upload_timeout),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((name, _)) = zero {
            return Err(Error::Core(vsnap_core::Error::configuration(format!(
                "{name} must be greater than 0"
            ))));
        }
        Ok(())
    }
}
