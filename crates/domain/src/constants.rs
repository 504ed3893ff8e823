//! Application constants
//!
//! Centralized location for all domain-level constants used throughout the
//! daemon.

// Retry policy
pub const MAX_RETRIES: i64 = 10;
pub const RETRY_BASE_DELAY_MS: i64 = 1_000;
pub const RETRY_MAX_DELAY_MS: i64 = 300_000;
pub const RETRY_JITTER_FACTOR: f64 = 0.5;

// Debouncer
pub const DEBOUNCE_MS: u64 = 500;

// Change-source settle window written into .watchmanconfig on registration
pub const WATCHMAN_SETTLE_MS: u64 = 500;

// Executor
pub const EXECUTOR_MAX_SLEEP_MS: u64 = 1_000;
pub const PAUSED_POLL_MS: u64 = 1_000;

// Control plane
pub const SIGNAL_POLL_MS: u64 = 1_000;
pub const GRACEFUL_STOP_TIMEOUT_SECS: u64 = 15;

// Remote tree
pub const REMOTE_ROOT_ALIAS: &str = "my_files";

// Shared store
pub const STATE_DB_FILE: &str = "state.db";
pub const APP_DIR_NAME: &str = "proton-drive-sync";
