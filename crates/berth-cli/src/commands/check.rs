//! `berth check` — Verify the container runtime is usable.

use berth_common::config::HarnessConfig;
use berth_runtime::backend::docker::DockerCli;
use berth_runtime::backend::ContainerRuntime;
use clap::Args;

use crate::output::{BOLD, DIM, GREEN, RED, RESET, print_header};

/// Arguments for the `check` command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Print the resolved configuration as JSON.
    #[arg(long)]
    pub show_config: bool,
}

/// Executes the `check` command.
///
/// # Errors
///
/// Returns an error if the runtime binary is missing or its daemon is
/// unreachable.
pub async fn execute(args: CheckArgs, config: HarnessConfig) -> anyhow::Result<()> {
    print_header();
    if args.show_config {
        eprintln!("{}", serde_json::to_string_pretty(&config)?);
        eprintln!();
    }

    let runtime = DockerCli::new(&config.runtime_binary)?;
    eprintln!(
        "  runtime   {BOLD}{}{RESET} {DIM}({}){RESET}",
        runtime.name(),
        runtime.binary().display()
    );
    match runtime.version().await {
        Ok(version) => {
            eprintln!("  server    {GREEN}●{RESET} {version}");
            eprintln!("  publish   {}", config.host);
            Ok(())
        }
        Err(e) => {
            eprintln!("  server    {RED}●{RESET} unreachable");
            Err(anyhow::anyhow!("{} daemon is not reachable: {e}", runtime.name()))
        }
    }
}
