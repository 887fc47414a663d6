//! Formatted output helpers for CLI commands.
//!
//! Provides the shared color codes, the banner, and human-readable
//! duration and endpoint formatting.

use std::collections::HashMap;
use std::time::Duration;

use berth_common::types::HostEndpoint;
use berth_sdk::ReadyContainer;

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const CYAN: &str = "\x1b[36m";
pub const RESET: &str = "\x1b[0m";

/// Prints the `berth vX.Y.Z` banner.
pub fn print_header() {
    eprintln!();
    eprintln!("  {BOLD}berth{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!();
}

/// Prints one ready container with its startup time and endpoints.
pub fn print_ready(container: &ReadyContainer) {
    eprintln!(
        "    {GREEN}●{RESET} {BOLD}{}{RESET} {DIM}[{}] ready in {}{RESET}",
        container.name(),
        container.id().short(),
        format_duration(container.startup_duration())
    );
    for line in endpoint_lines(container.endpoints()) {
        eprintln!("        {CYAN}->{RESET} {line}");
    }
}

/// Formats a duration as `850ms`, `2.3s` or `1m 05s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

/// `container_port -> host:port` lines, ascending by container port.
#[must_use]
pub fn endpoint_lines(endpoints: &HashMap<u16, HostEndpoint>) -> Vec<String> {
    let mut ports: Vec<_> = endpoints.iter().collect();
    ports.sort_by_key(|(port, _)| **port);
    ports
        .into_iter()
        .map(|(port, endpoint)| format!("{port}/tcp => {endpoint}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_displays_millis() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
    }

    #[test]
    fn format_duration_displays_seconds() {
        assert_eq!(format_duration(Duration::from_millis(2_340)), "2.3s");
    }

    #[test]
    fn format_duration_displays_minutes() {
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
    }

    #[test]
    fn endpoint_lines_are_sorted_by_container_port() {
        let endpoints = HashMap::from([
            (8983, HostEndpoint::new("127.0.0.1", 15666)),
            (80, HostEndpoint::new("127.0.0.1", 49153)),
        ]);
        assert_eq!(
            endpoint_lines(&endpoints),
            ["80/tcp => 127.0.0.1:49153", "8983/tcp => 127.0.0.1:15666"]
        );
    }
}
