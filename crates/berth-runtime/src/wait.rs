//! Readiness strategies.
//!
//! A strategy is a predicate evaluated repeatedly against a running
//! container. Probes never fail: connection refusals, HTTP errors and
//! unfinished commands all mean "not yet", and only the caller's deadline
//! or the container exiting ends the wait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, HostEndpoint, LogStream};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::backend::ContainerRuntime;
use crate::logs::LogBuffer;

/// Upper bound for a single TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for a single HTTP probe.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Condition that decides whether an HTTP probe response means "ready".
#[derive(Clone, Default)]
pub enum ResponseCheck {
    /// Any 2xx status.
    #[default]
    SuccessStatus,
    /// Exactly this status.
    Status(u16),
    /// A 2xx status whose body contains the text.
    BodyContains(String),
    /// Arbitrary predicate over status and body.
    Custom(Arc<dyn Fn(u16, &str) -> bool + Send + Sync>),
}

impl ResponseCheck {
    /// Wraps a closure as a response predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(u16, &str) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Evaluates the check.
    #[must_use]
    pub fn matches(&self, status: u16, body: &str) -> bool {
        let success = (200..300).contains(&status);
        match self {
            Self::SuccessStatus => success,
            Self::Status(expected) => status == *expected,
            Self::BodyContains(text) => success && body.contains(text.as_str()),
            Self::Custom(predicate) => predicate(status, body),
        }
    }

    const fn needs_body(&self) -> bool {
        matches!(self, Self::BodyContains(_) | Self::Custom(_))
    }
}

impl fmt::Debug for ResponseCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SuccessStatus => f.write_str("SuccessStatus"),
            Self::Status(code) => f.debug_tuple("Status").field(code).finish(),
            Self::BodyContains(text) => f.debug_tuple("BodyContains").field(text).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How to decide that a started container is usable.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// A TCP connect to the published port succeeds.
    PortOpen {
        /// Container port to probe through its host binding.
        port: u16,
    },
    /// A captured line on `stream` contains `pattern`.
    LogMessage {
        /// Substring to look for.
        pattern: String,
        /// Stream to scan.
        stream: LogStream,
    },
    /// An HTTP GET against the published port satisfies `check`.
    HttpSucceeds {
        /// Container port to probe through its host binding.
        port: u16,
        /// Request path.
        path: String,
        /// Response condition.
        check: ResponseCheck,
    },
    /// A command executed inside the container exits with status 0.
    CommandSucceeds {
        /// Program and arguments.
        command: Vec<String>,
    },
    /// Every member strategy is satisfied.
    AllOf(Vec<WaitStrategy>),
}

impl WaitStrategy {
    /// Ready once `port` accepts TCP connections.
    #[must_use]
    pub const fn port_open(port: u16) -> Self {
        Self::PortOpen { port }
    }

    /// Ready once a line on `stream` contains `pattern`.
    #[must_use]
    pub fn log_message(pattern: impl Into<String>, stream: LogStream) -> Self {
        Self::LogMessage {
            pattern: pattern.into(),
            stream,
        }
    }

    /// Ready once `GET path` on `port` returns a 2xx status.
    #[must_use]
    pub fn http(port: u16, path: impl Into<String>) -> Self {
        Self::http_with(port, path, ResponseCheck::SuccessStatus)
    }

    /// Ready once `GET path` on `port` satisfies `check`.
    #[must_use]
    pub fn http_with(port: u16, path: impl Into<String>, check: ResponseCheck) -> Self {
        Self::HttpSucceeds {
            port,
            path: path.into(),
            check,
        }
    }

    /// Ready once `command` exits with status 0 inside the container.
    #[must_use]
    pub fn command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::CommandSucceeds {
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    /// Ready once every strategy in `strategies` is.
    #[must_use]
    pub fn all_of(strategies: impl IntoIterator<Item = Self>) -> Self {
        Self::AllOf(strategies.into_iter().collect())
    }

    /// Container ports the strategy probes.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        match self {
            Self::PortOpen { port } | Self::HttpSucceeds { port, .. } => vec![*port],
            Self::LogMessage { .. } | Self::CommandSucceeds { .. } => Vec::new(),
            Self::AllOf(members) => members.iter().flat_map(Self::ports).collect(),
        }
    }

    /// `(stream, pattern)` pairs the strategy looks for in captured output.
    #[must_use]
    pub fn log_patterns(&self) -> Vec<(LogStream, &str)> {
        match self {
            Self::LogMessage { pattern, stream } => vec![(*stream, pattern.as_str())],
            Self::PortOpen { .. } | Self::HttpSucceeds { .. } | Self::CommandSucceeds { .. } => Vec::new(),
            Self::AllOf(members) => members.iter().flat_map(Self::log_patterns).collect(),
        }
    }

    /// Interval between probes when the definition does not override it.
    #[must_use]
    pub fn default_poll_interval(&self) -> Duration {
        match self {
            Self::PortOpen { .. } | Self::LogMessage { .. } => Duration::from_millis(100),
            Self::HttpSucceeds { .. } => Duration::from_millis(250),
            Self::CommandSucceeds { .. } => Duration::from_millis(500),
            Self::AllOf(members) => members
                .iter()
                .map(Self::default_poll_interval)
                .min()
                .unwrap_or(Duration::from_millis(100)),
        }
    }

    /// Checks the strategy's own invariants.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty patterns, commands, or
    /// member lists.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::PortOpen { .. } => Ok(()),
            Self::LogMessage { pattern, .. } if pattern.is_empty() => {
                Err(BerthError::config("log message pattern must not be empty"))
            }
            Self::LogMessage { .. } => Ok(()),
            Self::HttpSucceeds { path, .. } if !path.is_empty() && !path.starts_with('/') => {
                Err(BerthError::config(format!("http probe path must start with '/': {path}")))
            }
            Self::HttpSucceeds { .. } => Ok(()),
            Self::CommandSucceeds { command } if command.is_empty() => {
                Err(BerthError::config("readiness command must not be empty"))
            }
            Self::CommandSucceeds { .. } => Ok(()),
            Self::AllOf(members) if members.is_empty() => {
                Err(BerthError::config("all-of strategy needs at least one member"))
            }
            Self::AllOf(members) => members.iter().try_for_each(Self::validate),
        }
    }

    /// Runs one probe. `true` means ready.
    pub fn probe<'a>(&'a self, ctx: &'a ProbeContext<'a>) -> BoxFuture<'a, bool> {
        async move {
            match self {
                Self::PortOpen { port } => probe_port(ctx, *port).await,
                Self::LogMessage { pattern, stream } => ctx.logs.contains(*stream, pattern),
                Self::HttpSucceeds { port, path, check } => {
                    probe_http(ctx, *port, path, check).await
                }
                Self::CommandSucceeds { command } => probe_command(ctx, command).await,
                Self::AllOf(members) => {
                    for member in members {
                        if !member.probe(ctx).await {
                            return false;
                        }
                    }
                    true
                }
            }
        }
        .boxed()
    }
}

/// What a probe can observe about the container.
pub struct ProbeContext<'a> {
    /// Container name, for diagnostics.
    pub container: &'a str,
    /// Runtime id.
    pub id: &'a ContainerId,
    /// Host endpoints keyed by container port.
    pub endpoints: &'a HashMap<u16, HostEndpoint>,
    /// Captured output.
    pub logs: &'a LogBuffer,
    /// Runtime used for in-container commands.
    pub runtime: &'a dyn ContainerRuntime,
    /// Client used for HTTP probes.
    pub http: &'a reqwest::Client,
}

async fn probe_port(ctx: &ProbeContext<'_>, port: u16) -> bool {
    let Some(endpoint) = ctx.endpoints.get(&port) else {
        return false;
    };
    let connect = tokio::net::TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::trace!(container = ctx.container, %endpoint, error = %e, "port not open yet");
            false
        }
        Err(_) => false,
    }
}

async fn probe_http(ctx: &ProbeContext<'_>, port: u16, path: &str, check: &ResponseCheck) -> bool {
    let Some(endpoint) = ctx.endpoints.get(&port) else {
        return false;
    };
    let url = endpoint.http_url(path);
    let response = match ctx.http.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::trace!(container = ctx.container, url, error = %e, "http probe failed");
            return false;
        }
    };
    let status = response.status().as_u16();
    let body = if check.needs_body() {
        response.text().await.unwrap_or_default()
    } else {
        String::new()
    };
    let ready = check.matches(status, &body);
    tracing::trace!(container = ctx.container, url, status, ready, "http probe");
    ready
}

async fn probe_command(ctx: &ProbeContext<'_>, command: &[String]) -> bool {
    match ctx.runtime.exec(ctx.id, command).await {
        Ok(output) => output.success(),
        Err(e) => {
            tracing::trace!(container = ctx.container, error = %e, "readiness command failed");
            false
        }
    }
}
