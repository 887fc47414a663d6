//! `berth up` — Bring up a suite of containers until Ctrl+C.
//!
//! A suite is a YAML file listing container definitions:
//!
//! ```yaml
//! containers:
//!   - name: search
//!     image: solr:8.8.2
//!     command: [/opt/docker-solr/scripts/solr-precreate, techproducts]
//!     ports:
//!       - container: 8983
//!     wait:
//!       log_message: { pattern: Registered new searcher }
//!     startup_timeout_secs: 120
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use berth_common::config::HarnessConfig;
use berth_common::types::LogStream;
use berth_sdk::{BerthError, ContainerDefinition, Harness, ResponseCheck, WaitStrategy};
use clap::Args;
use serde::Deserialize;

use crate::output::{BOLD, GREEN, RESET, format_duration, print_header, print_ready};

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Path to the suite file.
    #[arg(default_value = "berth.yaml")]
    pub file: PathBuf,

    /// Tear down as soon as every container is ready.
    #[arg(long)]
    pub once: bool,
}

/// A suite file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    /// Containers to bring up together.
    pub containers: Vec<ContainerEntry>,
}

/// One container of a suite.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerEntry {
    name: Option<String>,
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    ports: Vec<PortEntry>,
    #[serde(default)]
    mounts: Vec<MountEntry>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    wait: WaitEntry,
    poll_interval_ms: Option<u64>,
    startup_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortEntry {
    container: u16,
    host: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MountEntry {
    host: PathBuf,
    container: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WaitEntry {
    PortOpen(u16),
    LogMessage {
        pattern: String,
        #[serde(default = "stdout")]
        stream: LogStream,
    },
    Http {
        port: u16,
        #[serde(default = "root")]
        path: String,
        status: Option<u16>,
        body_contains: Option<String>,
    },
    Command(Vec<String>),
    AllOf(Vec<WaitEntry>),
}

const fn stdout() -> LogStream {
    LogStream::Stdout
}

fn root() -> String {
    "/".to_string()
}

impl WaitEntry {
    fn into_strategy(self) -> WaitStrategy {
        match self {
            Self::PortOpen(port) => WaitStrategy::port_open(port),
            Self::LogMessage { pattern, stream } => WaitStrategy::log_message(pattern, stream),
            Self::Http {
                port,
                path,
                status,
                body_contains,
            } => {
                let check = match (status, body_contains) {
                    (Some(code), _) => ResponseCheck::Status(code),
                    (None, Some(text)) => ResponseCheck::BodyContains(text),
                    (None, None) => ResponseCheck::SuccessStatus,
                };
                WaitStrategy::http_with(port, path, check)
            }
            Self::Command(command) => WaitStrategy::command(command),
            Self::AllOf(members) => {
                WaitStrategy::all_of(members.into_iter().map(Self::into_strategy))
            }
        }
    }
}

impl ContainerEntry {
    /// Builds the definition, resolving relative mount sources against
    /// `base_dir`.
    fn into_definition(self, base_dir: &Path) -> berth_common::error::Result<ContainerDefinition> {
        let mut builder = ContainerDefinition::builder(self.image)
            .command(self.command)
            .wait_for(self.wait.into_strategy())
            .startup_timeout(Duration::from_secs(self.startup_timeout_secs));
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        for (key, value) in self.env {
            builder = builder.env(key, value);
        }
        for port in self.ports {
            builder = match port.host {
                Some(host) => builder.port_binding(port.container, host),
                None => builder.port(port.container),
            };
        }
        for mount in self.mounts {
            let source = if mount.host.is_absolute() {
                mount.host
            } else {
                base_dir.join(mount.host)
            };
            builder = if mount.read_only {
                builder.mount_read_only(source, mount.container)
            } else {
                builder.mount(source, mount.container)
            };
        }
        for (key, value) in self.labels {
            builder = builder.label(key, value);
        }
        if let Some(ms) = self.poll_interval_ms {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        builder.build()
    }
}

/// Parses a suite and builds its definitions.
///
/// # Errors
///
/// Returns an error if the YAML is malformed or a definition is invalid.
pub fn parse_suite(yaml: &str, base_dir: &Path) -> anyhow::Result<Vec<ContainerDefinition>> {
    let suite: Suite = serde_yaml::from_str(yaml)?;
    if suite.containers.is_empty() {
        anyhow::bail!("suite defines no containers");
    }
    let definitions = suite
        .containers
        .into_iter()
        .map(|entry| entry.into_definition(base_dir))
        .collect::<berth_common::error::Result<Vec<_>>>()?;
    Ok(definitions)
}

/// Executes the `up` command.
///
/// # Errors
///
/// Returns an error if the suite cannot be loaded, a container fails to
/// become ready, or teardown fails.
pub async fn execute(args: UpArgs, config: HarnessConfig) -> anyhow::Result<()> {
    let began = Instant::now();
    print_header();

    let yaml = std::fs::read_to_string(&args.file).map_err(|e| {
        anyhow::anyhow!(
            "Suite file not found: {} ({e})\n\
             Create a suite or specify a path: berth up <file>",
            args.file.display()
        )
    })?;
    let base_dir = args.file.parent().unwrap_or_else(|| Path::new("."));
    let definitions = parse_suite(&yaml, base_dir)?;
    tracing::info!(file = %args.file.display(), containers = definitions.len(), "suite loaded");

    let harness = Harness::docker(config)?;
    let once = args.once;
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    harness
        .run_until(definitions, interrupted, |ready| async move {
            eprintln!(
                "  {GREEN}{BOLD}{} container(s) ready{RESET} in {}:",
                ready.len(),
                format_duration(began.elapsed())
            );
            eprintln!();
            for container in &ready {
                print_ready(container);
            }
            if once {
                return Ok(());
            }
            eprintln!();
            eprintln!("  Press {BOLD}Ctrl+C{RESET} to stop all containers...");
            tokio::signal::ctrl_c().await
        })
        .await
        .map_err(|e| match e {
            BerthError::Interrupted => anyhow::anyhow!("interrupted; started containers were removed"),
            e => e.into(),
        })?;

    eprintln!();
    eprintln!("  {GREEN}All containers removed.{RESET}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r"
containers:
  - name: db
    image: postgres:15-alpine
    env:
      POSTGRES_PASSWORD: postgres
    ports:
      - container: 5432
    wait:
      all_of:
        - command: [pg_isready, -h, 127.0.0.1]
        - port_open: 5432
    startup_timeout_secs: 60
  - name: search
    image: solr:8.8.2
    command: [/opt/docker-solr/scripts/solr-precreate, techproducts]
    ports:
      - container: 8983
        host: 15666
    mounts:
      - host: fixtures
        container: /fixtures
        read_only: true
    wait:
      log_message:
        pattern: Registered new searcher
    poll_interval_ms: 50
    startup_timeout_secs: 120
";

    #[test]
    fn parses_suite_into_definitions() {
        let definitions = parse_suite(SUITE, Path::new("/srv/suite")).expect("suite");
        assert_eq!(definitions.len(), 2);

        let db = &definitions[0];
        assert_eq!(db.name(), "db");
        assert!(matches!(db.wait_strategy(), WaitStrategy::AllOf(members) if members.len() == 2));
        assert_eq!(db.startup_timeout(), Duration::from_secs(60));

        let search = &definitions[1];
        assert_eq!(search.mounts()[0].host_path, PathBuf::from("/srv/suite/fixtures"));
        assert!(search.mounts()[0].read_only);
        assert_eq!(search.effective_poll_interval(), Duration::from_millis(50));
        assert!(matches!(
            search.wait_strategy(),
            WaitStrategy::LogMessage { stream: LogStream::Stdout, .. }
        ));
    }

    #[test]
    fn http_wait_maps_response_checks() {
        let yaml = r"
containers:
  - image: nginx:alpine
    ports: [{ container: 80 }]
    wait:
      http: { port: 80, status: 204 }
    startup_timeout_secs: 30
";
        let definitions = parse_suite(yaml, Path::new(".")).expect("suite");
        let WaitStrategy::HttpSucceeds { path, check, .. } = definitions[0].wait_strategy() else {
            panic!("expected http strategy");
        };
        assert_eq!(path, "/");
        assert!(check.matches(204, "") && !check.matches(200, ""));
    }

    #[test]
    fn undeclared_probe_port_is_rejected() {
        let yaml = r"
containers:
  - image: nginx:alpine
    wait: { port_open: 80 }
    startup_timeout_secs: 30
";
        let err = parse_suite(yaml, Path::new(".")).expect_err("port 80 not published");
        assert!(err.to_string().contains("does not publish"));
    }

    #[test]
    fn missing_timeout_and_empty_suites_are_errors() {
        let no_timeout = "containers:\n  - image: nginx\n    wait: { port_open: 80 }\n";
        assert!(parse_suite(no_timeout, Path::new(".")).is_err());
        assert!(parse_suite("containers: []\n", Path::new(".")).is_err());
    }

    #[test]
    fn suites_load_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("berth.yaml");
        std::fs::write(&path, SUITE).expect("write");
        let yaml = std::fs::read_to_string(&path).expect("read");
        let definitions = parse_suite(&yaml, dir.path()).expect("suite");
        assert_eq!(definitions[1].mounts()[0].host_path, dir.path().join("fixtures"));
    }
}
