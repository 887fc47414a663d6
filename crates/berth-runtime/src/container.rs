//! Container handles and their lifecycle.
//!
//! A [`ContainerHandle`] owns one container from definition to disposal:
//!
//! ```text
//! Created -> Starting -> Running -> Ready | TimedOut | Failed -> Stopped -> Disposed
//! ```
//!
//! Lifecycle operations take `&mut self`, so transitions of one handle are
//! serialized while independent handles progress concurrently. Readiness
//! outcomes are values ([`Readiness`]), not errors, so a caller can tell a
//! slow container from a broken one and still dispose it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use berth_common::config::HarnessConfig;
use berth_common::constants::{MANAGED_LABEL, SESSION_LABEL};
use berth_common::error::{BerthError, Result};
use berth_common::types::{
    ContainerId, ContainerState, HostEndpoint, StateChange, Transition,
};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::backend::{ContainerRuntime, ContainerStatus, ExecOutput, RuntimeSpec};
use crate::definition::{ContainerDefinition, HostPort};
use crate::logs::{self, LogBuffer, LogCapture};
use crate::ports::{PortAllocator, PortBinding};
use crate::wait::{HTTP_PROBE_TIMEOUT, ProbeContext};

/// Shared services every handle of one session uses.
///
/// Cloning is cheap and shares the runtime, the port pool and the event
/// channel.
#[derive(Clone)]
pub struct RuntimeContext {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    config: Arc<HarnessConfig>,
    session: Arc<str>,
    events: broadcast::Sender<StateChange>,
    http: reqwest::Client,
}

impl RuntimeContext {
    /// Creates a session context over `runtime`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid, or a runtime
    /// error if the HTTP probe client cannot be built.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let ports = PortAllocator::from_config(&config)?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .build()
            .map_err(|e| BerthError::runtime(format!("building http probe client: {e}")))?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            runtime,
            ports,
            config: Arc::new(config),
            session: uuid::Uuid::new_v4().to_string().into(),
            events,
            http,
        })
    }

    /// The container runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// The shared host port pool.
    #[must_use]
    pub const fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Session id stamped on every container as a label.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Subscribes to state changes of every handle in this session.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("runtime", &self.runtime.name())
            .field("ports", &self.ports)
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Outcome of waiting for readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The strategy was satisfied.
    Ready {
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The budget ran out first.
    TimedOut {
        /// The budget.
        timeout: Duration,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The container process exited first.
    Failed {
        /// Exit code, when known.
        exit_code: Option<i64>,
        /// What happened.
        reason: String,
    },
}

impl Readiness {
    /// Whether the container became ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Converts non-ready outcomes into the matching error for `container`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::TimedOut`] or [`BerthError::Failed`].
    pub fn into_result(self, container: &str) -> Result<Duration> {
        match self {
            Self::Ready { elapsed } => Ok(elapsed),
            Self::TimedOut { timeout, .. } => Err(BerthError::TimedOut {
                container: container.to_string(),
                timeout,
            }),
            Self::Failed { exit_code, reason } => Err(BerthError::Failed {
                container: container.to_string(),
                exit_code,
                reason,
            }),
        }
    }
}

/// One container from definition to disposal.
pub struct ContainerHandle {
    definition: ContainerDefinition,
    ctx: RuntimeContext,
    state: ContainerState,
    id: Option<ContainerId>,
    bindings: Vec<PortBinding>,
    endpoints: HashMap<u16, HostEndpoint>,
    logs: LogBuffer,
    capture: Option<LogCapture>,
    history: Vec<Transition>,
}

impl ContainerHandle {
    /// Creates a handle in the `Created` state. Nothing is requested from
    /// the runtime until [`start`](Self::start).
    #[must_use]
    pub fn new(definition: ContainerDefinition, ctx: RuntimeContext) -> Self {
        let logs = LogBuffer::new(ctx.config.log_capture);
        for (stream, pattern) in definition.wait_strategy().log_patterns() {
            logs.watch(stream, pattern);
        }
        Self {
            definition,
            ctx,
            state: ContainerState::Created,
            id: None,
            bindings: Vec::new(),
            endpoints: HashMap::new(),
            logs,
            capture: None,
            history: Vec::new(),
        }
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Runtime id, once created.
    #[must_use]
    pub const fn id(&self) -> Option<&ContainerId> {
        self.id.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// The definition this handle was created from.
    #[must_use]
    pub const fn definition(&self) -> &ContainerDefinition {
        &self.definition
    }

    /// Captured output.
    #[must_use]
    pub const fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Host ports currently leased by this handle.
    #[must_use]
    pub fn bindings(&self) -> &[PortBinding] {
        &self.bindings
    }

    /// Every transition so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Time from `Starting` to `Ready`, once ready.
    #[must_use]
    pub fn startup_duration(&self) -> Option<Duration> {
        let entered = |state| self.history.iter().find(|t| t.to == state).map(|t| t.at);
        let (starting, ready) = (entered(ContainerState::Starting)?, entered(ContainerState::Ready)?);
        (ready - starting).to_std().ok()
    }

    /// Creates and launches the container.
    ///
    /// Leases host ports, creates the container with the session labels,
    /// starts it and attaches log capture. On failure the handle is left in
    /// `Failed` holding whatever it acquired, for [`dispose`](Self::dispose)
    /// to release.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidState`] unless the handle is `Created`,
    /// [`BerthError::PortInUse`] if a fixed host port is taken, and
    /// [`BerthError::Start`] if the runtime cannot create or launch it.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ContainerState::Created {
            return Err(self.invalid_state("start"));
        }
        self.transition(ContainerState::Starting);
        tracing::info!(name = %self.name(), image = %self.definition.image(), "starting container");

        let specs = self.definition.ports().to_vec();
        for spec in specs {
            let requested = match spec.host_port {
                HostPort::Auto => None,
                HostPort::Fixed(port) => Some(port),
            };
            match self.ctx.ports.allocate(spec.container_port, requested) {
                Ok(binding) => self.bindings.push(binding),
                Err(e @ BerthError::PortInUse { .. }) => {
                    self.transition(ContainerState::Failed);
                    return Err(e);
                }
                Err(e) => return Err(self.start_failed(&e)),
            }
        }

        let spec = self.runtime_spec();
        let id = match self.ctx.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => return Err(self.start_failed(&e)),
        };
        self.id = Some(id.clone());

        if let Err(e) = self.ctx.runtime.start(&id).await {
            return Err(self.start_failed(&e));
        }
        match self.ctx.runtime.follow_logs(&id).await {
            Ok(feed) => self.capture = Some(LogCapture::spawn(feed, self.logs.clone())),
            Err(e) => return Err(self.start_failed(&e)),
        }

        let host = self.ctx.ports.host().to_string();
        self.endpoints = self
            .bindings
            .iter()
            .map(|b| (b.container_port, HostEndpoint::new(host.clone(), b.host_port)))
            .collect();
        self.transition(ContainerState::Running);
        tracing::info!(name = %self.name(), id = %id.short(), ports = ?self.bindings, "container running");
        Ok(())
    }

    /// Polls the definition's wait strategy until it holds, `timeout`
    /// elapses, or the container exits.
    ///
    /// Moves the handle to `Ready`, `TimedOut` or `Failed` accordingly. A
    /// timeout ends only the wait; the container keeps running until it is
    /// stopped or disposed.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidState`] unless the handle is `Running`.
    pub async fn wait_until_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let id = match (&self.id, self.state) {
            (Some(id), ContainerState::Running) => id.clone(),
            _ => return Err(self.invalid_state("wait for")),
        };
        let interval = self.definition.effective_poll_interval();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts: u32 = 0;

        let outcome = loop {
            attempts += 1;
            let satisfied = {
                let ctx = ProbeContext {
                    container: self.definition.name(),
                    id: &id,
                    endpoints: &self.endpoints,
                    logs: &self.logs,
                    runtime: self.ctx.runtime.as_ref(),
                    http: &self.ctx.http,
                };
                let probe = self.definition.wait_strategy().probe(&ctx);
                tokio::time::timeout_at(deadline, probe).await.unwrap_or(false)
            };
            if satisfied {
                break Readiness::Ready {
                    elapsed: started.elapsed(),
                };
            }
            tracing::debug!(name = %self.name(), attempts, "not ready yet");

            if Instant::now() >= deadline {
                break Readiness::TimedOut {
                    timeout,
                    elapsed: started.elapsed(),
                };
            }
            let Ok(status) = tokio::time::timeout_at(deadline, self.ctx.runtime.inspect(&id)).await else {
                break Readiness::TimedOut {
                    timeout,
                    elapsed: started.elapsed(),
                };
            };
            match status {
                Ok(ContainerStatus::Running) => {}
                Ok(ContainerStatus::Exited { code }) => {
                    break Readiness::Failed {
                        exit_code: code,
                        reason: code.map_or_else(
                            || "container is gone".to_string(),
                            |code| format!("exited with code {code}"),
                        ),
                    };
                }
                Err(e) => {
                    break Readiness::Failed {
                        exit_code: None,
                        reason: format!("inspect failed: {e}"),
                    };
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break Readiness::TimedOut {
                    timeout,
                    elapsed: started.elapsed(),
                };
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        };

        match &outcome {
            Readiness::Ready { elapsed } => {
                self.transition(ContainerState::Ready);
                tracing::info!(
                    name = %self.name(),
                    elapsed = ?elapsed,
                    attempts,
                    "container ready"
                );
            }
            Readiness::TimedOut { elapsed, .. } => {
                self.transition(ContainerState::TimedOut);
                tracing::warn!(
                    name = %self.name(),
                    elapsed = ?elapsed,
                    attempts,
                    "container not ready in time"
                );
            }
            Readiness::Failed { reason, .. } => {
                self.transition(ContainerState::Failed);
                let tail: Vec<_> = self.logs.snapshot().into_iter().rev().take(5).collect();
                tracing::warn!(name = %self.name(), reason, last_lines = ?tail, "container failed before ready");
            }
        }
        Ok(outcome)
    }

    /// Host endpoint of a published container port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `container_port` is not published,
    /// or [`BerthError::NotReady`] before the handle is `Ready`.
    pub fn endpoint(&self, container_port: u16) -> Result<HostEndpoint> {
        if !self.definition.declares_port(container_port) {
            return Err(BerthError::config(format!(
                "{} does not publish port {container_port}",
                self.name()
            )));
        }
        self.ensure_ready()?;
        self.endpoints
            .get(&container_port)
            .cloned()
            .ok_or_else(|| BerthError::runtime(format!("port {container_port} has no host binding")))
    }

    /// Every published endpoint keyed by container port.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::NotReady`] before the handle is `Ready`.
    pub fn endpoints(&self) -> Result<HashMap<u16, HostEndpoint>> {
        self.ensure_ready()?;
        Ok(self.endpoints.clone())
    }

    /// Runs `command` inside the ready container.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::NotReady`] before the handle is `Ready`, or a
    /// runtime error if the command cannot be launched.
    pub async fn exec<S: AsRef<str>>(&self, command: &[S]) -> Result<ExecOutput> {
        self.ensure_ready()?;
        let id = self
            .id
            .as_ref()
            .ok_or_else(|| BerthError::runtime(format!("{} has no runtime id", self.name())))?;
        let argv: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        self.ctx.runtime.exec(id, &argv).await
    }

    /// Stops the container process and releases host ports and log
    /// capture. Idempotent.
    ///
    /// The handle reaches `Stopped` even if the runtime refuses to stop the
    /// container; that refusal is still returned.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the runtime fails to stop the container.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state.is_released() {
            return Ok(());
        }
        let result = match &self.id {
            Some(id) => self.ctx.runtime.stop(id, self.ctx.config.stop_timeout()).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            tracing::warn!(name = %self.name(), error = %e, "stop failed");
        }
        self.release_local();
        self.transition(ContainerState::Stopped);
        result
    }

    /// Stops and removes the container, persisting its output when a log
    /// directory is configured. Idempotent, and valid from every state.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first error from stopping, removing, or persisting logs.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.state == ContainerState::Disposed {
            return Ok(());
        }
        let stopped = self.stop().await;

        let removed = match self.remove_target() {
            Some(target) => self.ctx.runtime.remove(&target).await,
            None => Ok(()),
        };
        if let Err(e) = &removed {
            tracing::warn!(name = %self.name(), error = %e, "remove failed");
        }

        let persisted = match &self.ctx.config.log_dir {
            Some(dir) if self.launched() => logs::persist(dir, self.definition.name(), &self.logs)
                .map(|path| tracing::debug!(name = %self.name(), path = %path.display(), "logs persisted")),
            _ => Ok(()),
        };

        self.transition(ContainerState::Disposed);
        tracing::info!(name = %self.name(), "container disposed");
        stopped.and(removed).and(persisted)
    }

    fn runtime_spec(&self) -> RuntimeSpec {
        let mut labels: Vec<(String, String)> = self
            .definition
            .labels()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.push((MANAGED_LABEL.to_string(), "true".to_string()));
        labels.push((SESSION_LABEL.to_string(), self.ctx.session.to_string()));
        RuntimeSpec {
            name: self.definition.name().to_string(),
            image: self.definition.image().to_string(),
            command: self.definition.command().to_vec(),
            env: self
                .definition
                .env()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            host: self.ctx.ports.host().to_string(),
            ports: self.bindings.clone(),
            mounts: self.definition.mounts().to_vec(),
            labels,
        }
    }

    fn transition(&mut self, to: ContainerState) {
        let from = self.state;
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        let transition = Transition {
            from,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.history.push(transition.clone());
        tracing::debug!(name = %self.name(), %from, %to, "state change");
        let _ = self.ctx.events.send(StateChange {
            container: self.definition.name().to_string(),
            id: self.id.clone(),
            transition,
        });
    }

    fn start_failed(&mut self, cause: &BerthError) -> BerthError {
        self.transition(ContainerState::Failed);
        tracing::warn!(name = %self.name(), error = %cause, "container failed to start");
        BerthError::Start {
            container: self.name().to_string(),
            message: cause.to_string(),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> BerthError {
        BerthError::InvalidState {
            container: self.name().to_string(),
            operation,
            state: self.state,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == ContainerState::Ready {
            Ok(())
        } else {
            Err(BerthError::NotReady {
                container: self.name().to_string(),
                state: self.state,
            })
        }
    }

    /// Whether the runtime may hold a container for this handle.
    fn launched(&self) -> bool {
        self.history.iter().any(|t| t.to == ContainerState::Starting)
    }

    /// `create` may have succeeded without its id reaching us, so a
    /// launched handle without an id is removed by name.
    fn remove_target(&self) -> Option<String> {
        match &self.id {
            Some(id) => Some(id.as_str().to_string()),
            None if self.launched() => Some(self.definition.name().to_string()),
            None => None,
        }
    }

    fn release_local(&mut self) {
        self.capture = None;
        self.endpoints.clear();
        for binding in self.bindings.drain(..) {
            if !self.ctx.ports.release(binding) {
                tracing::warn!(
                    name = %self.definition.name(),
                    host_port = binding.host_port,
                    "host port was not leased at release"
                );
            }
        }
    }
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.definition.name())
            .field("id", &self.id)
            .field("state", &self.state)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.state == ContainerState::Disposed {
            return;
        }
        self.release_local();
        let Some(target) = self.remove_target() else {
            return;
        };
        tracing::warn!(name = %self.name(), state = %self.state, "container handle dropped without dispose");
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = Arc::clone(&self.ctx.runtime);
                drop(rt.spawn(async move {
                    if let Err(e) = runtime.remove(&target).await {
                        tracing::warn!(container = %target, error = %e, "best-effort removal failed");
                    }
                }));
            }
            Err(_) => {
                tracing::warn!(container = %target, "no async runtime to remove container; it is left behind");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use berth_common::types::LogStream;

    use super::*;
    use crate::backend::simulated::{SimulatedImage, SimulatedRuntime};
    use crate::wait::WaitStrategy;

    fn context(runtime: SimulatedRuntime) -> RuntimeContext {
        RuntimeContext::new(Arc::new(runtime), HarnessConfig::default()).expect("context")
    }

    fn definition(image: &str, name: &str, wait: WaitStrategy) -> ContainerDefinition {
        ContainerDefinition::builder(image)
            .name(name)
            .port(80)
            .wait_for(wait)
            .poll_interval(Duration::from_millis(20))
            .startup_timeout(Duration::from_secs(5))
            .build()
            .expect("definition")
    }

    #[tokio::test]
    async fn happy_path_records_every_transition() {
        let runtime = SimulatedRuntime::new().with_image(
            "web",
            SimulatedImage::new().log_after(Duration::from_millis(30), LogStream::Stdout, "up"),
        );
        let ctx = context(runtime.clone());
        let mut events = ctx.subscribe();
        let mut handle = ContainerHandle::new(
            definition("web", "web-1", WaitStrategy::log_message("up", LogStream::Stdout)),
            ctx,
        );

        handle.start().await.expect("start");
        let readiness = handle.wait_until_ready(Duration::from_secs(2)).await.expect("wait");
        assert!(readiness.is_ready());
        assert!(handle.startup_duration().is_some());
        assert_eq!(handle.endpoint(80).expect("endpoint").host, "127.0.0.1");

        handle.dispose().await.expect("dispose");
        let states: Vec<_> = handle.history().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            [
                ContainerState::Starting,
                ContainerState::Running,
                ContainerState::Ready,
                ContainerState::Stopped,
                ContainerState::Disposed,
            ]
        );
        assert_eq!(events.recv().await.expect("event").transition.to, ContainerState::Starting);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn endpoint_before_ready_is_not_ready() {
        let runtime = SimulatedRuntime::new().with_image("web", SimulatedImage::new());
        let mut handle = ContainerHandle::new(
            definition("web", "web-2", WaitStrategy::port_open(80)),
            context(runtime),
        );
        assert!(matches!(handle.endpoint(80), Err(BerthError::NotReady { .. })));
        assert!(matches!(handle.endpoint(81), Err(BerthError::Configuration { .. })));
        handle.start().await.expect("start");
        assert!(matches!(
            handle.endpoint(80),
            Err(BerthError::NotReady {
                state: ContainerState::Running,
                ..
            })
        ));
        assert!(handle.exec(&["true"]).await.is_err());
        handle.dispose().await.expect("dispose");
    }

    #[tokio::test]
    async fn pull_failure_is_a_start_error_and_still_disposes() {
        let runtime = SimulatedRuntime::new();
        let ctx = context(runtime.clone());
        let ports = ctx.ports().clone();
        let mut handle = ContainerHandle::new(
            definition("nope:latest", "web-3", WaitStrategy::port_open(80)),
            ctx,
        );
        let err = handle.start().await.expect_err("unknown image");
        assert!(matches!(err, BerthError::Start { .. }));
        assert_eq!(handle.state(), ContainerState::Failed);
        assert_eq!(ports.leased().len(), 1);

        handle.dispose().await.expect("dispose");
        assert!(ports.leased().is_empty());
        assert_eq!(runtime.remove_calls("web-3"), 1);
    }

    #[tokio::test]
    async fn wait_and_start_reject_wrong_states() {
        let runtime = SimulatedRuntime::new().with_image("web", SimulatedImage::new());
        let mut handle = ContainerHandle::new(
            definition("web", "web-4", WaitStrategy::port_open(80)),
            context(runtime),
        );
        assert!(matches!(
            handle.wait_until_ready(Duration::from_millis(10)).await,
            Err(BerthError::InvalidState { .. })
        ));
        handle.start().await.expect("start");
        assert!(matches!(handle.start().await, Err(BerthError::InvalidState { .. })));
        handle.dispose().await.expect("dispose");
    }

    #[tokio::test]
    async fn timed_out_handle_keeps_running_until_disposed() {
        let runtime = SimulatedRuntime::new().with_image("silent", SimulatedImage::new());
        let mut handle = ContainerHandle::new(
            definition("silent", "silent-1", WaitStrategy::log_message("never", LogStream::Stdout)),
            context(runtime.clone()),
        );
        handle.start().await.expect("start");
        let readiness = handle.wait_until_ready(Duration::from_millis(100)).await.expect("wait");
        assert!(matches!(readiness, Readiness::TimedOut { .. }));
        assert!(matches!(
            readiness.into_result("silent-1"),
            Err(BerthError::TimedOut { .. })
        ));
        assert_eq!(runtime.live_containers(), 1);
        handle.dispose().await.expect("dispose");
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn persisted_logs_land_in_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = SimulatedRuntime::new().with_image(
            "chatty",
            SimulatedImage::new().log_after(Duration::ZERO, LogStream::Stderr, "hello"),
        );
        let config = HarnessConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..HarnessConfig::default()
        };
        let ctx = RuntimeContext::new(Arc::new(runtime), config).expect("context");
        let mut handle = ContainerHandle::new(
            definition("chatty", "chatty-1", WaitStrategy::log_message("hello", LogStream::Stderr)),
            ctx,
        );
        handle.start().await.expect("start");
        assert!(handle.wait_until_ready(Duration::from_secs(2)).await.expect("wait").is_ready());
        handle.dispose().await.expect("dispose");

        let content = std::fs::read_to_string(logs::log_path(dir.path(), "chatty-1")).expect("read");
        assert!(content.contains("[stderr] hello"));
    }

    #[tokio::test]
    async fn stop_tolerates_a_lease_already_returned() {
        let runtime = SimulatedRuntime::new().with_image("web", SimulatedImage::new());
        let ctx = context(runtime);
        let ports = ctx.ports().clone();
        let mut handle = ContainerHandle::new(
            definition("web", "web-released", WaitStrategy::port_open(80)),
            ctx,
        );
        handle.start().await.expect("start");
        let binding = handle.bindings()[0];

        assert!(ports.release(binding));
        handle.stop().await.expect("stop");
        assert!(handle.bindings().is_empty());
        assert!(!ports.release(binding));
        assert!(ports.leased().is_empty());
        handle.dispose().await.expect("dispose");
    }

    #[tokio::test]
    async fn dropped_handle_releases_ports_and_removes_container() {
        let runtime = SimulatedRuntime::new().with_image("web", SimulatedImage::new());
        let ctx = context(runtime.clone());
        let ports = ctx.ports().clone();
        let mut handle = ContainerHandle::new(
            definition("web", "web-5", WaitStrategy::port_open(80)),
            ctx,
        );
        handle.start().await.expect("start");
        drop(handle);
        assert!(ports.leased().is_empty());

        for _ in 0..50 {
            if runtime.remove_calls("web-5") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.remove_calls("web-5"), 1);
    }
}
