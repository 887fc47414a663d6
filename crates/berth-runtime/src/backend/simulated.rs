//! In-process runtime that scripts container behavior.
//!
//! Each image is registered with a [`SimulatedImage`] script: output lines
//! emitted at offsets from start, a TCP (optionally HTTP) listener that opens
//! on the published host port after a delay, an exit after a delay, or a
//! launch failure. Listeners are real sockets, so port and HTTP readiness
//! probes exercise the same code paths as against a real daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use berth_common::constants::LOG_CHANNEL_CAPACITY;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, LogLine, LogStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ContainerRuntime, ContainerStatus, ExecOutput, RuntimeSpec};

/// A listener a simulated container opens after starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListenScript {
    container_port: u16,
    after: Duration,
    http_status: Option<u16>,
}

/// Scripted behavior of every container created from one image.
#[derive(Debug, Clone, Default)]
pub struct SimulatedImage {
    logs: Vec<(Duration, LogLine)>,
    listeners: Vec<ListenScript>,
    exit: Option<(Duration, i64)>,
    exec_ready_after: Option<Duration>,
    create_error: Option<String>,
    start_error: Option<String>,
}

impl SimulatedImage {
    /// An image whose containers run forever and do nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `text` to `stream` once `after` has elapsed since start.
    #[must_use]
    pub fn log_after(mut self, after: Duration, stream: LogStream, text: impl Into<String>) -> Self {
        self.logs.push((after, LogLine::new(stream, text)));
        self
    }

    /// Accepts TCP connections on `container_port` once `after` has elapsed.
    #[must_use]
    pub fn listen_after(mut self, container_port: u16, after: Duration) -> Self {
        self.listeners.push(ListenScript {
            container_port,
            after,
            http_status: None,
        });
        self
    }

    /// Answers every HTTP request on `container_port` with `status` once
    /// `after` has elapsed.
    #[must_use]
    pub fn serve_http_after(mut self, container_port: u16, after: Duration, status: u16) -> Self {
        self.listeners.push(ListenScript {
            container_port,
            after,
            http_status: Some(status),
        });
        self
    }

    /// The main process exits with `code` once `after` has elapsed.
    #[must_use]
    pub const fn exit_after(mut self, after: Duration, code: i64) -> Self {
        self.exit = Some((after, code));
        self
    }

    /// Commands run inside the container exit 0 once `after` has elapsed
    /// since start, and 1 before.
    #[must_use]
    pub const fn exec_succeeds_after(mut self, after: Duration) -> Self {
        self.exec_ready_after = Some(after);
        self
    }

    /// `create` fails with `message`, as a failed image pull would.
    #[must_use]
    pub fn fail_create(mut self, message: impl Into<String>) -> Self {
        self.create_error = Some(message.into());
        self
    }

    /// `start` fails with `message`, as a host port conflict would.
    #[must_use]
    pub fn fail_start(mut self, message: impl Into<String>) -> Self {
        self.start_error = Some(message.into());
        self
    }
}

#[derive(Debug)]
struct SimContainer {
    spec: RuntimeSpec,
    script: SimulatedImage,
    started: Option<Instant>,
    stopped: Option<i64>,
    removed: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl SimContainer {
    fn status(&self) -> ContainerStatus {
        if self.removed {
            return ContainerStatus::Exited { code: None };
        }
        if let Some(code) = self.stopped {
            return ContainerStatus::Exited { code: Some(code) };
        }
        match (self.started, self.script.exit) {
            (Some(started), Some((after, code))) if started.elapsed() >= after => {
                ContainerStatus::Exited { code: Some(code) }
            }
            _ => ContainerStatus::Running,
        }
    }

    fn halt(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    images: HashMap<String, SimulatedImage>,
    containers: HashMap<ContainerId, SimContainer>,
    remove_calls: HashMap<String, usize>,
}

/// Runtime whose containers follow [`SimulatedImage`] scripts.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRuntime {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRuntime {
    /// Creates a runtime with no known images.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the script for `image`. Unknown images fail to pull.
    #[must_use]
    pub fn with_image(self, image: impl Into<String>, script: SimulatedImage) -> Self {
        if let Ok(mut state) = self.lock() {
            let _ = state.images.insert(image.into(), script);
        }
        self
    }

    /// Number of containers created and not yet removed.
    #[must_use]
    pub fn live_containers(&self) -> usize {
        self.lock()
            .map(|state| state.containers.values().filter(|c| !c.removed).count())
            .unwrap_or_default()
    }

    /// How often `remove` was called for the container named `name`.
    #[must_use]
    pub fn remove_calls(&self, name: &str) -> usize {
        self.lock()
            .map(|state| state.remove_calls.get(name).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Names of every container ever created, sorted.
    #[must_use]
    pub fn created_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|state| state.containers.values().map(|c| c.spec.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| BerthError::runtime("simulated runtime lock poisoned"))
    }

    fn with_container<T>(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut SimContainer) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock()?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| BerthError::runtime(format!("no such container: {id}")))?;
        f(container)
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create(&self, spec: &RuntimeSpec) -> Result<ContainerId> {
        let mut state = self.lock()?;
        let script = state.images.get(&spec.image).cloned().ok_or_else(|| {
            BerthError::runtime(format!("pull access denied for {}", spec.image))
        })?;
        if let Some(message) = &script.create_error {
            return Err(BerthError::runtime(message.clone()));
        }
        if state
            .containers
            .values()
            .any(|c| !c.removed && c.spec.name == spec.name)
        {
            return Err(BerthError::runtime(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        let id = ContainerId::generate();
        let _ = state.containers.insert(
            id.clone(),
            SimContainer {
                spec: spec.clone(),
                script,
                started: None,
                stopped: None,
                removed: false,
                tasks: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.with_container(id, |container| {
            if let Some(message) = &container.script.start_error {
                return Err(BerthError::runtime(message.clone()));
            }
            let started = Instant::now();
            container.started = Some(started);
            for listen in container.script.listeners.clone() {
                let binding = container
                    .spec
                    .ports
                    .iter()
                    .find(|b| b.container_port == listen.container_port);
                if let Some(binding) = binding {
                    let addr = (container.spec.host.clone(), binding.host_port);
                    container.tasks.push(tokio::spawn(serve(addr, started + listen.after, listen.http_status)));
                }
            }
            if let Some((after, _)) = container.script.exit {
                // The process is gone; so are its sockets.
                let listeners: Vec<_> = container.tasks.iter().map(JoinHandle::abort_handle).collect();
                container.tasks.push(tokio::spawn(async move {
                    tokio::time::sleep_until(started + after).await;
                    for listener in listeners {
                        listener.abort();
                    }
                }));
            }
            Ok(())
        })
    }

    async fn follow_logs(&self, id: &ContainerId) -> Result<mpsc::Receiver<LogLine>> {
        let (started, mut script) = self.with_container(id, |container| {
            let started = container
                .started
                .ok_or_else(|| BerthError::runtime(format!("container {id} is not started")))?;
            Ok((started, container.script.logs.clone()))
        })?;
        script.sort_by_key(|(after, _)| *after);

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            for (after, line) in script {
                tokio::time::sleep_until(started + after).await;
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        });
        self.with_container(id, |container| {
            container.tasks.push(task);
            Ok(())
        })?;
        Ok(rx)
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let state = self.lock()?;
        Ok(state
            .containers
            .get(id)
            .map_or(ContainerStatus::Exited { code: None }, SimContainer::status))
    }

    async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<ExecOutput> {
        self.with_container(id, |container| {
            let Some(started) = container.started else {
                return Err(BerthError::runtime(format!("container {id} is not running")));
            };
            if container.status() != ContainerStatus::Running {
                return Err(BerthError::runtime(format!("container {id} is not running")));
            }
            let ready = container
                .script
                .exec_ready_after
                .is_none_or(|after| started.elapsed() >= after);
            Ok(ExecOutput {
                stdout: if ready { command.join(" ") } else { String::new() },
                stderr: String::new(),
                exit_code: if ready { 0 } else { 1 },
            })
        })
    }

    async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<()> {
        self.with_container(id, |container| {
            if container.stopped.is_none() {
                let code = match container.status() {
                    ContainerStatus::Exited { code } => code.unwrap_or(0),
                    ContainerStatus::Running => 137,
                };
                container.stopped = Some(code);
            }
            container.halt();
            Ok(())
        })
    }

    async fn remove(&self, target: &str) -> Result<()> {
        let mut state = self.lock()?;
        let found = state
            .containers
            .iter_mut()
            .find(|(id, c)| !c.removed && (id.as_str() == target || c.spec.name == target));
        let name = match found {
            Some((_, container)) => {
                container.halt();
                container.removed = true;
                container.spec.name.clone()
            }
            None => target.to_string(),
        };
        *state.remove_calls.entry(name).or_default() += 1;
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }
}

/// Opens a listener on `addr` at `opens_at`, answering HTTP if `http_status`
/// is set and otherwise closing each accepted connection.
async fn serve(addr: (String, u16), opens_at: Instant, http_status: Option<u16>) {
    tokio::time::sleep_until(opens_at).await;
    let listener = match TcpListener::bind((addr.0.as_str(), addr.1)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(host = %addr.0, port = addr.1, error = %e, "simulated listener could not bind");
            return;
        }
    };
    while let Ok((mut socket, _)) = listener.accept().await {
        let Some(status) = http_status else {
            continue;
        };
        drop(tokio::spawn(async move {
            let mut request = [0_u8; 1024];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 {status} Simulated\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortBinding;

    fn spec(name: &str, image: &str) -> RuntimeSpec {
        RuntimeSpec {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            env: Vec::new(),
            host: "127.0.0.1".into(),
            ports: Vec::new(),
            mounts: Vec::new(),
            labels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unknown_images_fail_to_pull() {
        let runtime = SimulatedRuntime::new();
        let err = runtime.create(&spec("x", "missing:latest")).await.expect_err("unknown image");
        assert!(err.to_string().contains("pull access denied"));
    }

    #[tokio::test]
    async fn scripted_exit_is_reported_by_inspect() {
        let runtime = SimulatedRuntime::new()
            .with_image("crash", SimulatedImage::new().exit_after(Duration::ZERO, 2));
        let id = runtime.create(&spec("crash-1", "crash")).await.expect("create");
        assert_eq!(runtime.inspect(&id).await.expect("inspect"), ContainerStatus::Running);
        runtime.start(&id).await.expect("start");
        assert_eq!(
            runtime.inspect(&id).await.expect("inspect"),
            ContainerStatus::Exited { code: Some(2) }
        );
    }

    #[tokio::test]
    async fn logs_are_replayed_from_start() {
        let runtime = SimulatedRuntime::new().with_image(
            "chatty",
            SimulatedImage::new()
                .log_after(Duration::ZERO, LogStream::Stdout, "first")
                .log_after(Duration::from_millis(10), LogStream::Stderr, "second"),
        );
        let id = runtime.create(&spec("chatty-1", "chatty")).await.expect("create");
        runtime.start(&id).await.expect("start");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut feed = runtime.follow_logs(&id).await.expect("logs");
        assert_eq!(feed.recv().await.expect("line").text, "first");
        let second = feed.recv().await.expect("line");
        assert_eq!((second.stream, second.text.as_str()), (LogStream::Stderr, "second"));
    }

    #[tokio::test]
    async fn http_listener_answers_with_scripted_status() {
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let host_port = probe.local_addr().expect("addr").port();
        drop(probe);

        let runtime = SimulatedRuntime::new()
            .with_image("web", SimulatedImage::new().serve_http_after(80, Duration::ZERO, 204));
        let mut web = spec("web-1", "web");
        web.ports.push(PortBinding {
            container_port: 80,
            host_port,
        });
        let id = runtime.create(&web).await.expect("create");
        runtime.start(&id).await.expect("start");

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{host_port}/");
        let mut status = None;
        for _ in 0..50 {
            if let Ok(response) = client.get(&url).send().await {
                status = Some(response.status().as_u16());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Some(204));
        runtime.remove("web-1").await.expect("remove");
    }

    #[tokio::test]
    async fn exec_follows_readiness_script() {
        let runtime = SimulatedRuntime::new().with_image(
            "postgres",
            SimulatedImage::new().exec_succeeds_after(Duration::from_millis(50)),
        );
        let id = runtime.create(&spec("pg", "postgres")).await.expect("create");
        runtime.start(&id).await.expect("start");
        let cmd = vec!["pg_isready".to_string()];
        assert!(!runtime.exec(&id, &cmd).await.expect("exec").success());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(runtime.exec(&id, &cmd).await.expect("exec").success());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_counted_by_name() {
        let runtime = SimulatedRuntime::new().with_image("idle", SimulatedImage::new());
        let id = runtime.create(&spec("idle-1", "idle")).await.expect("create");
        runtime.remove(id.as_str()).await.expect("remove by id");
        runtime.remove("idle-1").await.expect("remove by name");
        assert_eq!(runtime.remove_calls("idle-1"), 2);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(
            runtime.inspect(&id).await.expect("inspect"),
            ContainerStatus::Exited { code: None }
        );
    }
}
