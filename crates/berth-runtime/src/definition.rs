//! Immutable container definitions and the fluent builder that produces them.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use berth_common::constants;
use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

use crate::wait::WaitStrategy;

/// Host side of a port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPort {
    /// Any free host port, chosen at start.
    Auto,
    /// A specific host port; start fails with `PortInUse` if it is taken.
    Fixed(u16),
}

/// A container port published to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Requested host port.
    pub host_port: HostPort,
}

/// A host path mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mount {
    /// Source path on the host.
    pub host_path: PathBuf,
    /// Absolute target path inside the container.
    pub container_path: String,
    /// Whether the container sees the mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Everything needed to launch one container. Immutable once built.
#[derive(Debug, Clone)]
pub struct ContainerDefinition {
    image: String,
    name: String,
    command: Vec<String>,
    env: BTreeMap<String, String>,
    ports: Vec<PortSpec>,
    mounts: Vec<Mount>,
    labels: BTreeMap<String, String>,
    wait: WaitStrategy,
    poll_interval: Option<Duration>,
    startup_timeout: Duration,
}

impl ContainerDefinition {
    /// Starts a builder for `image`.
    #[must_use]
    pub fn builder(image: impl Into<String>) -> ContainerBuilder {
        ContainerBuilder::new().image(image)
    }

    /// Image reference (`repository[:tag]`).
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command override; empty means the image default.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Environment variables, sorted by key.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Published ports, unique by container port.
    #[must_use]
    pub fn ports(&self) -> &[PortSpec] {
        &self.ports
    }

    /// Host path mounts.
    #[must_use]
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// User labels.
    #[must_use]
    pub const fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Readiness strategy.
    #[must_use]
    pub const fn wait_strategy(&self) -> &WaitStrategy {
        &self.wait
    }

    /// Poll interval override, if any.
    #[must_use]
    pub const fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    /// Interval between readiness probes.
    #[must_use]
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval
            .unwrap_or_else(|| self.wait.default_poll_interval())
    }

    /// Readiness budget supplied by the caller.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Whether `container_port` is published.
    #[must_use]
    pub fn declares_port(&self, container_port: u16) -> bool {
        self.ports.iter().any(|p| p.container_port == container_port)
    }
}

/// Builder for configuring a container before launch.
///
/// Setters only record values; all validation happens in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    image: Option<String>,
    name: Option<String>,
    command: Vec<String>,
    env: BTreeMap<String, String>,
    ports: Vec<PortSpec>,
    mounts: Vec<Mount>,
    labels: BTreeMap<String, String>,
    wait: Option<WaitStrategy>,
    poll_interval: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl ContainerBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets the container name. A unique name is generated when unset.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replaces the image's default command.
    #[must_use]
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Publishes `container_port` on any free host port.
    #[must_use]
    pub fn port(mut self, container_port: u16) -> Self {
        self.ports.push(PortSpec {
            container_port,
            host_port: HostPort::Auto,
        });
        self
    }

    /// Publishes `container_port` on a specific host port.
    #[must_use]
    pub fn port_binding(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.push(PortSpec {
            container_port,
            host_port: HostPort::Fixed(host_port),
        });
        self
    }

    /// Mounts a host path into the container.
    #[must_use]
    pub fn mount(mut self, host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        });
        self
    }

    /// Mounts a host path into the container read-only.
    #[must_use]
    pub fn mount_read_only(
        mut self,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
    ) -> Self {
        self.mounts.push(Mount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        });
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets the readiness strategy.
    #[must_use]
    pub fn wait_for(mut self, strategy: WaitStrategy) -> Self {
        self.wait = Some(strategy);
        self
    }

    /// Overrides the strategy's default poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the readiness budget. There is no default.
    #[must_use]
    pub const fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Validates the accumulated configuration and freezes it.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Configuration`] if the image, wait strategy, or
    /// startup timeout is missing, a port is declared twice, or the wait
    /// strategy probes a port that is not published.
    pub fn build(self) -> Result<ContainerDefinition> {
        let image = self
            .image
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| BerthError::config("image is required"))?;

        let name = match self.name {
            Some(name) => {
                validate_name(&name)?;
                name
            }
            None => generated_name(&image),
        };

        validate_ports(&self.ports)?;
        for mount in &self.mounts {
            if !mount.container_path.starts_with('/') {
                return Err(BerthError::config(format!(
                    "mount target must be absolute: {}",
                    mount.container_path
                )));
            }
        }

        let wait = self
            .wait
            .ok_or_else(|| BerthError::config(format!("wait strategy is required for {name}")))?;
        wait.validate()?;
        for port in wait.ports() {
            if !self.ports.iter().any(|p| p.container_port == port) {
                return Err(BerthError::config(format!(
                    "wait strategy probes port {port} which {name} does not publish"
                )));
            }
        }

        if self.poll_interval.is_some_and(|i| i.is_zero()) {
            return Err(BerthError::config("poll interval must be positive"));
        }
        let startup_timeout = self
            .startup_timeout
            .ok_or_else(|| BerthError::config(format!("startup timeout is required for {name}")))?;
        if startup_timeout.is_zero() {
            return Err(BerthError::config("startup timeout must be positive"));
        }

        Ok(ContainerDefinition {
            image,
            name,
            command: self.command,
            env: self.env,
            ports: self.ports,
            mounts: self.mounts,
            labels: self.labels,
            wait,
            poll_interval: self.poll_interval,
            startup_timeout,
        })
    }
}

fn validate_ports(ports: &[PortSpec]) -> Result<()> {
    let mut container_ports = HashSet::new();
    let mut host_ports = HashSet::new();
    for spec in ports {
        if spec.container_port == 0 {
            return Err(BerthError::config("container port 0 is not valid"));
        }
        if !container_ports.insert(spec.container_port) {
            return Err(BerthError::config(format!(
                "container port {} is declared twice",
                spec.container_port
            )));
        }
        if let HostPort::Fixed(host) = spec.host_port {
            if host == 0 {
                return Err(BerthError::config("fixed host port 0 is not valid, use an automatic binding"));
            }
            if !host_ports.insert(host) {
                return Err(BerthError::config(format!("host port {host} is requested twice")));
            }
        }
    }
    Ok(())
}

/// Container runtimes accept `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid_first && valid_rest {
        Ok(())
    } else {
        Err(BerthError::config(format!("invalid container name: {name:?}")))
    }
}

/// `berth-<image stem>-<8 hex chars>`.
fn generated_name(image: &str) -> String {
    let stem: String = image
        .rsplit('/')
        .next()
        .unwrap_or(image)
        .split([':', '@'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let suffix = suffix.get(..8).unwrap_or(&suffix);
    if stem.is_empty() {
        format!("{}-{suffix}", constants::NAME_PREFIX)
    } else {
        format!("{}-{stem}-{suffix}", constants::NAME_PREFIX)
    }
}
