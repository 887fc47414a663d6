//! System-wide constants and defaults.

/// Container runtime binary used when none is configured.
pub const DEFAULT_RUNTIME_BINARY: &str = "docker";

/// Host address used for published ports and returned endpoints.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Grace period given to a container process before it is killed.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Capacity of the lifecycle event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Capacity of the per-container live log channel.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Label set on every container launched by berth.
pub const MANAGED_LABEL: &str = "berth.managed";

/// Label carrying the id of the harness session that launched a container.
pub const SESSION_LABEL: &str = "berth.session";

/// Prefix of generated container names.
pub const NAME_PREFIX: &str = "berth";

/// Application name used in CLI output.
pub const APP_NAME: &str = "berth";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";
