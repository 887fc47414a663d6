//! Domain primitive types used across the berth workspace.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime-assigned identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first twelve characters, as container runtimes display ids.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container handle.
///
/// ```text
/// Created -> Starting -> Running -> Ready | TimedOut | Failed -> Stopped -> Disposed
/// ```
///
/// Any state may move to `Stopped`/`Disposed` so that a partially started
/// container is still torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// The handle exists but nothing was requested from the runtime yet.
    Created,
    /// The runtime is creating and launching the container.
    Starting,
    /// The container process is running; readiness is unknown.
    Running,
    /// The readiness strategy was satisfied.
    Ready,
    /// Readiness was not reached within the caller's budget.
    TimedOut,
    /// The container process exited or could not be launched.
    Failed,
    /// The container process has been stopped.
    Stopped,
    /// Every resource held by the handle has been released.
    Disposed,
}

impl ContainerState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Disposed, _) => false,
            (_, Self::Disposed) => true,
            (Self::Stopped, _) => false,
            (_, Self::Stopped) => true,
            (Self::Created, Self::Starting)
            | (Self::Starting, Self::Running | Self::Failed)
            | (Self::Running, Self::Ready | Self::TimedOut | Self::Failed) => true,
            _ => false,
        }
    }

    /// Whether the state ends the lifecycle with an error.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::TimedOut | Self::Failed)
    }

    /// Whether teardown has already happened.
    #[must_use]
    pub const fn is_released(self) -> bool {
        matches!(self, Self::Stopped | Self::Disposed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::TimedOut => "timed-out",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// A recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State before the transition.
    pub from: ContainerState,
    /// State after the transition.
    pub to: ContainerState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// A transition observed on a named container, as published to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Name of the container.
    pub container: String,
    /// Runtime id, once the runtime has assigned one.
    pub id: Option<ContainerId>,
    /// The transition itself.
    pub transition: Transition,
}

/// Output stream of a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of captured container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Stream the line was written to.
    pub stream: LogStream,
    /// Line content without the trailing newline.
    pub text: String,
}

impl LogLine {
    /// Creates a log line.
    #[must_use]
    pub fn new(stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

/// Externally reachable address of a published container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEndpoint {
    /// Host name or address.
    pub host: String,
    /// Host-side port.
    pub port: u16,
}

impl HostEndpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns `http://host:port` followed by `path`.
    #[must_use]
    pub fn http_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://{}:{}/{path}", self.host, self.port)
    }

    /// Resolves the endpoint into a socket address when the host is an IP literal.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use ContainerState::{Created, Disposed, Ready, Running, Starting, Stopped};
        let path = [Created, Starting, Running, Ready, Stopped, Disposed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn ready_is_only_reachable_from_running() {
        for state in [
            ContainerState::Created,
            ContainerState::Starting,
            ContainerState::TimedOut,
            ContainerState::Failed,
            ContainerState::Stopped,
        ] {
            assert!(!state.can_transition_to(ContainerState::Ready), "{state}");
        }
        assert!(ContainerState::Running.can_transition_to(ContainerState::Ready));
    }

    #[test]
    fn teardown_is_reachable_from_partial_starts() {
        assert!(ContainerState::Starting.can_transition_to(ContainerState::Stopped));
        assert!(ContainerState::Created.can_transition_to(ContainerState::Disposed));
        assert!(ContainerState::TimedOut.can_transition_to(ContainerState::Stopped));
        assert!(!ContainerState::Disposed.can_transition_to(ContainerState::Stopped));
        assert!(!ContainerState::Stopped.can_transition_to(ContainerState::Running));
    }

    #[test]
    fn short_id_truncates_long_ids() {
        let id = ContainerId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(ContainerId::new("abc").short(), "abc");
    }

    #[test]
    fn endpoint_formats_urls_and_addresses() {
        let ep = HostEndpoint::new("127.0.0.1", 15666);
        assert_eq!(ep.http_url("/solr/techproducts"), "http://127.0.0.1:15666/solr/techproducts");
        assert_eq!(ep.http_url(""), "http://127.0.0.1:15666/");
        assert_eq!(ep.socket_addr().map(|a| a.port()), Some(15666));
        assert!(HostEndpoint::new("localhost", 80).socket_addr().is_none());
    }
}
