//! System-wide constants shared across modules.

// Task scheduling

/// How often the scheduler coordinator polls the store for work.
pub const TASK_POLL_INTERVAL_MS: u64 = 100;

/// Maximum number of queued tasks promoted to RUNNING per scheduler tick.
pub const MAX_TASKS_PROMOTED_PER_TICK: usize = 8;

/// Repeated errors of the same type inside this window are logged once.
pub const ERROR_BACKOFF_MS: u64 = 500;

/// How long to wait for runners to drain on shutdown before logging them.
pub const SHUTDOWN_TIMEOUT_SECONDS: f64 = 30.0;

// Exit codes (the only contractual part of the CLI surface)

pub const EXIT_CODE_SUCCESS: i32 = 0;
/// All tests passed but some were flaky.
pub const EXIT_CODE_FLAKY_SUCCESS: i32 = 34;
/// An irrecoverable core error was detected; the process exits immediately
/// after emitting a single telemetry event.
pub const EXIT_CODE_IRRECOVERABLE_ERROR: i32 = 86;

// Concurrency group

pub const DEFAULT_EXIT_TIMEOUT_SECONDS: f64 = 4.0;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: f64 = 4.0;

// Agent cancellation: soft grace before the hard kill.
pub const AGENT_TERMINATE_GRACE_SECONDS: f64 = 2.0;

// Local sync

pub const LOCAL_SYNC_DEBOUNCE_SECONDS: f64 = 0.25;
pub const LOCAL_SYNC_MAX_DEBOUNCE_SECONDS: f64 = 2.0;

// Environment services

pub const TERMINAL_SERVER_NAME: &str = "terminal";
/// Points at the auth reverse proxy in front of the terminal, not the
/// terminal process itself.
pub const TERMINAL_SERVER_PORT: u16 = 80;
pub const SSHD_SERVER_NAME: &str = "sshd";
pub const SSHD_SERVER_PORT: u16 = 2222;

/// Directory (under the environment root) holding runner state.
pub const STATE_DIRECTORY: &str = "state";
/// Directory (under the environment root) holding agent artifacts.
pub const ARTIFACTS_DIRECTORY: &str = "artifacts";

// Streaming endpoints

/// Bounded wait for each queue read on a streaming endpoint.
pub const STREAM_POLL_SECONDS: u64 = 1;
/// Emit a keepalive after this long with no data on a streaming endpoint.
pub const STREAM_KEEPALIVE_SECONDS: u64 = 10;
/// Minimum interval between `/repo-info` pushes.
pub const REPO_INFO_INTERVAL_SECONDS: u64 = 3;

// Logs

/// Rotate the server log file once it reaches this size.
pub const LOG_ROTATION_BYTES: u64 = 100 * 1024 * 1024;
