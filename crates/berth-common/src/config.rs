//! Global configuration model for the berth harness.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BerthError, Result};

/// How much container output a log buffer retains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LogCaptureMode {
    /// Keep every line for the lifetime of the handle.
    #[default]
    Unbounded,
    /// Keep at most `max_lines` per stream, dropping the oldest first.
    Bounded {
        /// Maximum number of retained lines per stream.
        max_lines: usize,
    },
}

/// Root configuration for a harness session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Container runtime binary (`docker` or a CLI-compatible alternative).
    pub runtime_binary: String,
    /// Host address ports are published on.
    pub host: String,
    /// Grace period in seconds before a stopping container is killed.
    pub stop_timeout_secs: u64,
    /// Retention policy for captured output.
    pub log_capture: LogCaptureMode,
    /// Directory where captured output is persisted on disposal.
    pub log_dir: Option<PathBuf>,
    /// Inclusive host port range used for automatic bindings.
    pub port_range: Option<(u16, u16)>,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runtime_binary: constants::DEFAULT_RUNTIME_BINARY.to_string(),
            host: constants::DEFAULT_HOST.to_string(),
            stop_timeout_secs: constants::DEFAULT_STOP_TIMEOUT_SECS,
            log_capture: LogCaptureMode::Unbounded,
            log_dir: None,
            port_range: None,
            event_capacity: constants::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl HarnessConfig {
    /// Builds a configuration from defaults overlaid with `BERTH_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from defaults overlaid with values returned by
    /// `lookup` for each `BERTH_*` key.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(binary) = lookup("BERTH_RUNTIME") {
            config.runtime_binary = binary;
        }
        if let Some(host) = lookup("BERTH_HOST") {
            config.host = host;
        }
        if let Some(secs) = lookup("BERTH_STOP_TIMEOUT_SECS") {
            config.stop_timeout_secs = secs.trim().parse().map_err(|_| {
                BerthError::config(format!("BERTH_STOP_TIMEOUT_SECS is not a number: {secs}"))
            })?;
        }
        if let Some(dir) = lookup("BERTH_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(range) = lookup("BERTH_PORT_RANGE") {
            config.port_range = Some(parse_port_range(&range)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is empty or out of range.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_binary.trim().is_empty() {
            return Err(BerthError::config("runtime binary must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(BerthError::config("host must not be empty"));
        }
        if let Some((start, end)) = self.port_range {
            if start == 0 || start > end {
                return Err(BerthError::config(format!(
                    "invalid port range {start}-{end}"
                )));
            }
        }
        if let LogCaptureMode::Bounded { max_lines: 0 } = self.log_capture {
            return Err(BerthError::config("bounded log capture needs max_lines > 0"));
        }
        if self.event_capacity == 0 {
            return Err(BerthError::config("event capacity must be positive"));
        }
        Ok(())
    }

    /// Grace period before a stopping container is killed.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Parses `start-end` into an inclusive port range.
fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let invalid = || BerthError::config(format!("invalid port range: {raw}"));
    let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
    let start = start.trim().parse().map_err(|_| invalid())?;
    let end = end.trim().parse().map_err(|_| invalid())?;
    Ok((start, end))
}
