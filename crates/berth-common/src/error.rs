//! Unified error types for the berth workspace.
//!
//! Every failure a harness user can observe maps to one variant here, so
//! callers can tell a slow container (`TimedOut`) apart from a broken one
//! (`Failed`, `Start`) without string matching.

use std::time::Duration;

use thiserror::Error;

use crate::types::ContainerState;

/// Boxed error produced by user scenario code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// A container definition or configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The container could not be created or launched.
    #[error("container {container} failed to start: {message}")]
    Start {
        /// Name of the container.
        container: String,
        /// Runtime diagnostic (pull failure, port conflict, runtime unavailable).
        message: String,
    },

    /// Readiness was not reached within the caller's budget.
    #[error("container {container} not ready after {}ms", .timeout.as_millis())]
    TimedOut {
        /// Name of the container.
        container: String,
        /// Budget that elapsed.
        timeout: Duration,
    },

    /// The container process exited before becoming ready.
    #[error("container {container} exited before becoming ready: {reason}")]
    Failed {
        /// Name of the container.
        container: String,
        /// Exit code, when the runtime reported one.
        exit_code: Option<i64>,
        /// Human-readable reason.
        reason: String,
    },

    /// A requested host port is already bound.
    #[error("host port {port} is already in use")]
    PortInUse {
        /// The conflicting host port.
        port: u16,
    },

    /// An endpoint was requested before the container became ready.
    #[error("container {container} is not ready (state: {state})")]
    NotReady {
        /// Name of the container.
        container: String,
        /// State the container was in.
        state: ContainerState,
    },

    /// A lifecycle operation was called from a state that does not allow it.
    #[error("cannot {operation} container {container} in state {state}")]
    InvalidState {
        /// Name of the container.
        container: String,
        /// Operation that was attempted.
        operation: &'static str,
        /// State the container was in.
        state: ContainerState,
    },

    /// The container runtime reported an error after launch.
    #[error("container runtime error: {message}")]
    Runtime {
        /// Runtime diagnostic.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// Bring-up was abandoned on a shutdown request before every container
    /// was ready.
    #[error("interrupted while bringing up containers")]
    Interrupted,

    /// The scenario run against the ready containers returned an error.
    #[error("scenario failed: {source}")]
    Scenario {
        /// Error returned by the scenario.
        source: BoxError,
    },
}

impl BerthError {
    /// Shorthand for a [`BerthError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a [`BerthError::Runtime`].
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Shorthand for a [`BerthError::Io`].
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying with a larger budget can help.
    ///
    /// Only a readiness timeout qualifies; every other variant is fatal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = BerthError::TimedOut {
            container: "solr".into(),
            timeout: Duration::from_secs(60),
        };
        assert!(timeout.is_retryable());

        let failed = BerthError::Failed {
            container: "solr".into(),
            exit_code: Some(1),
            reason: "exited".into(),
        };
        assert!(!failed.is_retryable());
        assert!(!BerthError::PortInUse { port: 15666 }.is_retryable());
    }

    #[test]
    fn timed_out_message_reports_budget() {
        let err = BerthError::TimedOut {
            container: "nginx".into(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "container nginx not ready after 1500ms");
    }

    #[test]
    fn not_ready_message_includes_state() {
        let err = BerthError::NotReady {
            container: "db".into(),
            state: ContainerState::Running,
        };
        assert_eq!(err.to_string(), "container db is not ready (state: running)");
    }
}
