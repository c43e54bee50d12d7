//! Environment variable helpers.
//!
//! Every helper treats an unset or whitespace-only variable as absent and
//! reports malformed values as [`Error::Configuration`] naming the variable.

use std::time::Duration;

use crate::error::{Error, Result};

/// Returns the trimmed value of `name`, or `None` when unset or blank.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Parses `name` as a `u64`.
///
/// # Errors
///
/// Returns an error if the variable is set but not a valid `u64`.
pub fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
}

/// Parses `name` as a `u32`.
///
/// # Errors
///
/// Returns an error if the variable is set but not a valid `u32`.
pub fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
}

/// Parses `name` as a whole number of seconds.
///
/// # Errors
///
/// Returns an error if the value is not a `u64` or is zero.
pub fn env_duration_secs(name: &str) -> Result<Option<Duration>> {
    positive(name, env_u64(name)?).map(|v| v.map(Duration::from_secs))
}

/// Parses `name` as a whole number of milliseconds.
///
/// # Errors
///
/// Returns an error if the value is not a `u64` or is zero.
pub fn env_duration_millis(name: &str) -> Result<Option<Duration>> {
    positive(name, env_u64(name)?).map(|v| v.map(Duration::from_millis))
}

fn positive(name: &str, value: Option<u64>) -> Result<Option<u64>> {
    match value {
        Some(0) => Err(Error::configuration(format!(
            "{name} must be greater than 0"
        ))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_durations_are_rejected() {
        assert!(positive("VSNAP_TEST", Some(0)).is_err());
        assert_eq!(positive("VSNAP_TEST", Some(5)).unwrap(), Some(5));
        assert_eq!(positive("VSNAP_TEST", None).unwrap(), None);
    }

    #[test]
    fn unset_variables_are_absent() {
        let name = "VSNAP_CORE_TEST_SURELY_UNSET";
        assert!(env_string(name).is_none());
        assert!(env_u64(name).unwrap().is_none());
        assert!(env_duration_secs(name).unwrap().is_none());
    }
}
