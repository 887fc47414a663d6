//! Scenario runner over a set of ready containers.
//!
//! [`Harness::run`] is the scoped-acquisition entry point: every container
//! it starts is disposed before it returns, whether setup fails, the
//! scenario returns an error, or the scenario panics.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use berth_common::config::HarnessConfig;
use berth_common::error::{BerthError, BoxError, Result};
use berth_common::types::{ContainerId, HostEndpoint};
use berth_runtime::backend::{self, ContainerRuntime, ExecOutput};
use berth_runtime::container::{ContainerHandle, RuntimeContext};
use berth_runtime::definition::ContainerDefinition;
use berth_runtime::logs::LogBuffer;
use futures::FutureExt;
use futures::future::{join_all, try_join_all};

use crate::event::EventListener;

/// Runs scenarios against containers started from definitions.
#[derive(Debug, Clone)]
pub struct Harness {
    ctx: RuntimeContext,
}

impl Harness {
    /// Creates a harness over an explicit runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: HarnessConfig) -> Result<Self> {
        Ok(Self {
            ctx: RuntimeContext::new(runtime, config)?,
        })
    }

    /// Creates a harness driving the configured docker-compatible CLI.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the runtime
    /// binary is not on `PATH`.
    pub fn docker(config: HarnessConfig) -> Result<Self> {
        let runtime = backend::detect_runtime(&config)?;
        Self::new(runtime, config)
    }

    /// Shared session services.
    #[must_use]
    pub const fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Subscribes to lifecycle events of every container this harness runs.
    #[must_use]
    pub fn subscribe(&self) -> EventListener {
        EventListener::new(self.ctx.subscribe())
    }

    /// Starts every definition, waits for all of them to be ready, runs
    /// `scenario`, and disposes every container.
    ///
    /// Containers start and wait concurrently, each within its definition's
    /// startup timeout. The first start failure, timeout or early exit
    /// abandons the remaining waits; the scenario then never runs.
    ///
    /// # Errors
    ///
    /// Returns, in this priority: the setup error, the scenario's error as
    /// [`BerthError::Scenario`], or the first disposal error.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `scenario` once every container has been
    /// disposed.
    pub async fn run<T, E, F, Fut>(&self, definitions: Vec<ContainerDefinition>, scenario: F) -> Result<T>
    where
        F: FnOnce(ReadySet) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run_until(definitions, std::future::pending(), scenario).await
    }

    /// Like [`run`](Self::run), but abandons bring-up as soon as `shutdown`
    /// completes. Every container started so far is still disposed.
    ///
    /// `shutdown` is only watched until the scenario starts.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Interrupted`] if `shutdown` completes first,
    /// otherwise the same errors as [`run`](Self::run).
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `scenario` once every container has been
    /// disposed.
    pub async fn run_until<T, E, F, Fut, S>(
        &self,
        definitions: Vec<ContainerDefinition>,
        shutdown: S,
        scenario: F,
    ) -> Result<T>
    where
        F: FnOnce(ReadySet) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
        S: Future<Output = ()>,
    {
        check_unique_names(&definitions)?;
        let mut handles: Vec<ContainerHandle> = definitions
            .into_iter()
            .map(|definition| ContainerHandle::new(definition, self.ctx.clone()))
            .collect();
        tracing::info!(containers = handles.len(), session = %self.ctx.session(), "bringing up containers");

        let brought_up = tokio::select! {
            result = bring_up(&mut handles) => result,
            () = shutdown => {
                tracing::warn!("shutdown requested during bring-up");
                Err(BerthError::Interrupted)
            }
        };
        let setup = brought_up.and_then(|()| self.ready_set(&handles));
        let ready = match setup {
            Ok(ready) => ready,
            Err(e) => {
                let disposed = dispose_all(&mut handles).await;
                return Err(first_error(e, disposed));
            }
        };

        let outcome = AssertUnwindSafe(async move { scenario(ready).await })
            .catch_unwind()
            .await;
        let disposed = dispose_all(&mut handles).await;
        match outcome {
            Ok(Ok(value)) => disposed.map(|()| value),
            Ok(Err(e)) => {
                let source: BoxError = e.into();
                tracing::warn!(error = %source, "scenario failed");
                if let Err(e) = disposed {
                    tracing::warn!(error = %e, "disposal after failed scenario also failed");
                }
                Err(BerthError::Scenario { source })
            }
            Err(panic) => {
                tracing::error!("scenario panicked, containers disposed");
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn ready_set(&self, handles: &[ContainerHandle]) -> Result<ReadySet> {
        let containers = handles
            .iter()
            .map(|handle| {
                Ok(ReadyContainer {
                    name: handle.name().to_string(),
                    id: handle
                        .id()
                        .cloned()
                        .ok_or_else(|| BerthError::runtime(format!("{} has no runtime id", handle.name())))?,
                    endpoints: handle.endpoints()?,
                    logs: handle.logs().clone(),
                    startup_duration: handle.startup_duration().unwrap_or_default(),
                    runtime: Arc::clone(self.ctx.runtime()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ReadySet { containers })
    }
}

async fn bring_up(handles: &mut [ContainerHandle]) -> Result<()> {
    let started = try_join_all(handles.iter_mut().map(|handle| async move {
        handle.start().await?;
        let timeout = handle.definition().startup_timeout();
        handle.wait_until_ready(timeout).await?.into_result(handle.name())
    }))
    .await;
    match started {
        Ok(durations) => {
            tracing::info!(?durations, "all containers ready");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "bring-up failed");
            Err(e)
        }
    }
}

/// Disposes every handle concurrently and returns the first error.
async fn dispose_all(handles: &mut [ContainerHandle]) -> Result<()> {
    join_all(handles.iter_mut().map(|handle| handle.dispose()))
        .await
        .into_iter()
        .collect()
}

fn first_error(setup: BerthError, disposed: Result<()>) -> BerthError {
    if let Err(e) = disposed {
        tracing::warn!(error = %e, "disposal after failed setup also failed");
    }
    setup
}

fn check_unique_names(definitions: &[ContainerDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for definition in definitions {
        if !seen.insert(definition.name()) {
            return Err(BerthError::config(format!(
                "container name {} is used twice",
                definition.name()
            )));
        }
    }
    Ok(())
}

/// Snapshot of a ready container handed to scenario code.
#[derive(Clone)]
pub struct ReadyContainer {
    name: String,
    id: ContainerId,
    endpoints: HashMap<u16, HostEndpoint>,
    logs: LogBuffer,
    startup_duration: Duration,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ReadyContainer {
    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Host endpoint of a published container port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `container_port` is not published.
    pub fn endpoint(&self, container_port: u16) -> Result<HostEndpoint> {
        self.endpoints.get(&container_port).cloned().ok_or_else(|| {
            BerthError::config(format!("{} does not publish port {container_port}", self.name))
        })
    }

    /// Every published endpoint keyed by container port.
    #[must_use]
    pub const fn endpoints(&self) -> &HashMap<u16, HostEndpoint> {
        &self.endpoints
    }

    /// Captured output, still growing while the scenario runs.
    #[must_use]
    pub const fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Time from launch to readiness.
    #[must_use]
    pub const fn startup_duration(&self) -> Duration {
        self.startup_duration
    }

    /// Runs `command` inside the container.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the command cannot be launched.
    pub async fn exec<S: AsRef<str>>(&self, command: &[S]) -> Result<ExecOutput> {
        let argv: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        self.runtime.exec(&self.id, &argv).await
    }
}

impl std::fmt::Debug for ReadyContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyContainer")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("endpoints", &self.endpoints)
            .field("startup_duration", &self.startup_duration)
            .finish_non_exhaustive()
    }
}

/// The ready containers of one [`Harness::run`], in definition order.
#[derive(Debug, Clone)]
pub struct ReadySet {
    containers: Vec<ReadyContainer>,
}

impl ReadySet {
    /// The container named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ReadyContainer> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// The container named `name`, or a configuration error.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no container has that name.
    pub fn require(&self, name: &str) -> Result<&ReadyContainer> {
        self.get(name)
            .ok_or_else(|| BerthError::config(format!("no container named {name}")))
    }

    /// Every ready container in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &ReadyContainer> {
        self.containers.iter()
    }

    /// Number of containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl<'a> IntoIterator for &'a ReadySet {
    type Item = &'a ReadyContainer;
    type IntoIter = std::slice::Iter<'a, ReadyContainer>;

    fn into_iter(self) -> Self::IntoIter {
        self.containers.iter()
    }
}

#[cfg(test)]
mod tests {
    use berth_common::types::LogStream;
    use berth_runtime::wait::WaitStrategy;

    use super::*;

    fn definition(name: &str) -> ContainerDefinition {
        ContainerDefinition::builder("web")
            .name(name)
            .wait_for(WaitStrategy::log_message("x", LogStream::Stdout))
            .startup_timeout(Duration::from_secs(1))
            .build()
            .expect("definition")
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(check_unique_names(&[definition("a"), definition("b")]).is_ok());
        assert!(matches!(
            check_unique_names(&[definition("a"), definition("a")]),
            Err(BerthError::Configuration { .. })
        ));
    }

    #[test]
    fn setup_error_wins_over_disposal_error() {
        let setup = BerthError::PortInUse { port: 15666 };
        let chosen = first_error(setup, Err(BerthError::runtime("rm failed")));
        assert!(matches!(chosen, BerthError::PortInUse { port: 15666 }));
    }
}
