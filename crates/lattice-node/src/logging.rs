//! Tracing subscriber configuration for node service hosts.
//!
//! Log levels follow these conventions:
//! - ERROR: Unrecoverable failures, fatal engine result codes
//! - WARN: Recoverable errors, dropped datagrams, failed tap operations
//! - INFO: High-level lifecycle (ports picked, networks up, termination)
//! - DEBUG: Per-item state changes, binding churn, reconciler decisions
//! - TRACE: Wire-level data and engine trace output

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with sensible defaults.
///
/// Log level can be controlled via the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Initialize the tracing subscriber with JSON output.
///
/// Useful for structured logging in containerized environments.
/// Activated by setting `RUST_LOG_FORMAT=json`.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

/// Initialize the tracing subscriber for tests.
///
/// Uses `try_init` to avoid panicking if called multiple times.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
