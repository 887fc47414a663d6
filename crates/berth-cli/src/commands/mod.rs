//! CLI command definitions and dispatch.

pub mod check;
pub mod demo;
pub mod up;

use std::path::PathBuf;

use berth_common::config::HarnessConfig;
use clap::{Parser, Subcommand};

/// berth — disposable containers for integration tests.
#[derive(Parser, Debug)]
#[command(name = "berth", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Container runtime binary (docker or a CLI-compatible alternative).
    #[arg(long, global = true, env = "BERTH_RUNTIME")]
    pub runtime: Option<String>,

    /// Directory where captured container output is written on teardown.
    #[arg(long, global = true, env = "BERTH_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the container runtime is installed and reachable.
    Check(check::CheckArgs),
    /// Bring up a suite of containers and keep them until Ctrl+C.
    Up(up::UpArgs),
    /// Run one of the reference workloads.
    Demo(demo::DemoArgs),
}

impl Cli {
    /// Harness configuration from `BERTH_*` variables overlaid with flags.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment value is malformed.
    pub fn config(&self) -> anyhow::Result<HarnessConfig> {
        let mut config = HarnessConfig::from_env()?;
        if let Some(runtime) = &self.runtime {
            config.runtime_binary.clone_from(runtime);
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config()?;
    match cli.command {
        Command::Check(args) => check::execute(args, config).await,
        Command::Up(args) => up::execute(args, config).await,
        Command::Demo(args) => demo::execute(args, config).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn runtime_flag_is_global() {
        let cli = Cli::parse_from(["berth", "--runtime", "podman", "check"]);
        assert_eq!(cli.runtime.as_deref(), Some("podman"));
        assert!(matches!(cli.command, Command::Check(_)));
    }

    #[test]
    fn demo_takes_a_workload() {
        let cli = Cli::parse_from(["berth", "demo", "solr", "--products", "500"]);
        let Command::Demo(args) = cli.command else {
            panic!("expected demo");
        };
        assert_eq!(args.workload, demo::Workload::Solr);
        assert_eq!(args.products, 500);
    }
}
