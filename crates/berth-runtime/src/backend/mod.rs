//! Container runtime abstraction.
//!
//! The harness depends only on the narrow operation set of
//! [`ContainerRuntime`]; [`docker::DockerCli`] drives a real daemon and
//! [`simulated::SimulatedRuntime`] scripts container behavior in-process.

pub mod docker;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_common::config::HarnessConfig;
use berth_common::error::Result;
use berth_common::types::{ContainerId, LogLine};
use tokio::sync::mpsc;

use crate::definition::Mount;
use crate::ports::PortBinding;

/// A definition resolved against its leased host ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command override; empty means the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Host address the ports are published on.
    pub host: String,
    /// Published ports.
    pub ports: Vec<PortBinding>,
    /// Host path mounts.
    pub mounts: Vec<Mount>,
    /// Labels, including the harness bookkeeping labels.
    pub labels: Vec<(String, String)>,
}

/// Process state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// The main process is alive.
    Running,
    /// The main process has exited, or the container no longer exists.
    Exited {
        /// Exit code, if the runtime knows it.
        code: Option<i64>,
    },
}

/// Output from a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i64,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Platform-agnostic container runtime.
///
/// Implementors handle the runtime-specific details of container creation,
/// output attachment, and teardown.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short runtime name for diagnostics.
    fn name(&self) -> &str;

    /// Creates a container, pulling the image if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be pulled or the container
    /// cannot be created.
    async fn create(&self, spec: &RuntimeSpec) -> Result<ContainerId>;

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started (for example a
    /// host port conflict).
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Streams the container's output from its first line onwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot attach to the container.
    async fn follow_logs(&self, id: &ContainerId) -> Result<mpsc::Receiver<LogLine>>;

    /// Reports whether the container's main process is still running.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus>;

    /// Runs a command inside a running container.
    ///
    /// A non-zero exit code is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be launched.
    async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<ExecOutput>;

    /// Stops the container, killing it after `grace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refuses to stop the container.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<()>;

    /// Removes a container by id or name, with its anonymous volumes.
    /// Removing a missing container succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refuses to remove the container.
    async fn remove(&self, target: &str) -> Result<()>;

    /// Returns the runtime's server version.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime daemon is unreachable.
    async fn version(&self) -> Result<String>;

    /// Returns whether the runtime daemon is reachable.
    async fn is_available(&self) -> bool {
        self.version().await.is_ok()
    }
}

/// Creates the CLI-driven runtime named by the configuration.
///
/// # Errors
///
/// Returns an error if the runtime binary cannot be found on `PATH`.
pub fn detect_runtime(config: &HarnessConfig) -> Result<Arc<dyn ContainerRuntime>> {
    Ok(Arc::new(docker::DockerCli::new(&config.runtime_binary)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_success_is_exit_code_zero() {
        let ok = ExecOutput {
            stdout: "1\n".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(ok.success());
        assert!(!ExecOutput { exit_code: 2, ..ok }.success());
    }

    #[test]
    fn missing_runtime_binary_is_reported() {
        let config = HarnessConfig {
            runtime_binary: "berth-no-such-runtime-binary".into(),
            ..HarnessConfig::default()
        };
        assert!(detect_runtime(&config).is_err());
    }
}
