//! Runtime backend driving the `docker` CLI (or a CLI-compatible binary
//! such as `podman`) through `tokio::process`.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use berth_common::constants::LOG_CHANNEL_CAPACITY;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, LogLine, LogStream};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{ContainerRuntime, ContainerStatus, ExecOutput, RuntimeSpec};

/// Runtime that shells out to a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    name: String,
}

impl DockerCli {
    /// Locates `binary` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the binary cannot be found.
    pub fn new(binary: &str) -> Result<Self> {
        let path = which::which(binary).map_err(|_| {
            BerthError::runtime(format!("{binary} not found on PATH (is a container runtime installed?)"))
        })?;
        Ok(Self::with_path(path, binary))
    }

    /// Uses an explicit binary path.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
            name: name.into(),
        }
    }

    /// Path of the CLI binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::debug!(binary = %self.binary.display(), ?args, "invoking runtime CLI");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BerthError::io(format!("running {}", self.binary.display()), e))
    }

    /// Runs the CLI and returns trimmed stdout, failing on a non-zero exit.
    async fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(BerthError::runtime(format!(
                "{} {} failed: {}",
                self.name,
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, spec: &RuntimeSpec) -> Result<ContainerId> {
        tracing::info!(name = %spec.name, image = %spec.image, "creating container");
        let stdout = self.run_checked(&create_args(spec)).await?;
        // Pull progress may precede the id.
        let id = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BerthError::runtime(format!("{} create printed no container id", self.name)))?;
        Ok(ContainerId::new(id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        let _ = self.run_checked(&args(["start", id.as_str()])).await?;
        Ok(())
    }

    async fn follow_logs(&self, id: &ContainerId) -> Result<mpsc::Receiver<LogLine>> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BerthError::io(format!("attaching to logs of {}", id.short()), e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BerthError::runtime("log follower has no output pipes"));
        };

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let short = id.short().to_string();
        drop(tokio::spawn(async move {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);
            while out_open || err_open {
                let line = tokio::select! {
                    next = out.next_line(), if out_open => match next {
                        Ok(Some(text)) => Some(LogLine::new(LogStream::Stdout, text)),
                        _ => { out_open = false; None }
                    },
                    next = err.next_line(), if err_open => match next {
                        Ok(Some(text)) => Some(LogLine::new(LogStream::Stderr, text)),
                        _ => { err_open = false; None }
                    },
                };
                if let Some(line) = line {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
            // The follower is killed on drop if it is still attached.
            drop(child);
            tracing::debug!(id = %short, "log follower finished");
        }));
        Ok(rx)
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let output = self.output(&args(["inspect", "--type", "container", id.as_str()])).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(ContainerStatus::Exited { code: None });
            }
            return Err(BerthError::runtime(format!(
                "{} inspect failed: {}",
                self.name,
                stderr.trim()
            )));
        }
        parse_inspect(&output.stdout)
    }

    async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<ExecOutput> {
        let mut argv = args(["exec", id.as_str()]);
        argv.extend(command.iter().cloned());
        let output = self.output(&argv).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().map_or(-1, i64::from),
        })
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let output = self.output(&args(["stop", "--time", secs.as_str(), id.as_str()])).await?;
        if output.status.success() || is_missing(&String::from_utf8_lossy(&output.stderr)) {
            tracing::info!(id = %id.short(), "container stopped");
            Ok(())
        } else {
            Err(BerthError::runtime(format!(
                "{} stop failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn remove(&self, target: &str) -> Result<()> {
        let output = self.output(&args(["rm", "--force", "--volumes", target])).await?;
        if output.status.success() || is_missing(&String::from_utf8_lossy(&output.stderr)) {
            tracing::info!(container = target, "container removed");
            Ok(())
        } else {
            Err(BerthError::runtime(format!(
                "{} rm failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn version(&self) -> Result<String> {
        self.run_checked(&args(["version", "--format", "{{.Server.Version}}"]))
            .await
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Arguments for `create`, publishing each binding on the spec's host.
pub(crate) fn create_args(spec: &RuntimeSpec) -> Vec<String> {
    let mut argv = args(["create", "--name", spec.name.as_str()]);
    for (key, value) in &spec.labels {
        argv.push("--label".into());
        argv.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.env {
        argv.push("--env".into());
        argv.push(format!("{key}={value}"));
    }
    for binding in &spec.ports {
        argv.push("--publish".into());
        argv.push(format!(
            "{}:{}:{}",
            spec.host, binding.host_port, binding.container_port
        ));
    }
    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host_path.display(), mount.container_path);
        if mount.read_only {
            volume.push_str(":ro");
        }
        argv.push("--volume".into());
        argv.push(volume);
    }
    argv.push(spec.image.clone());
    argv.extend(spec.command.iter().cloned());
    argv
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

fn parse_inspect(stdout: &[u8]) -> Result<ContainerStatus> {
    let entries: Vec<InspectEntry> = serde_json::from_slice(stdout)?;
    let state = entries
        .into_iter()
        .next()
        .map(|entry| entry.state)
        .ok_or_else(|| BerthError::runtime("inspect returned no containers"))?;
    Ok(match state.status.as_str() {
        "exited" | "dead" | "removing" => ContainerStatus::Exited {
            code: state.exit_code,
        },
        _ => ContainerStatus::Running,
    })
}
