//! Error types for the node service.

/// Errors that can occur while configuring or starting the service.
///
/// Once the control loop is running, errors no longer propagate as
/// `Result`s: transient faults are logged and skipped, fatal faults set
/// the termination reason and stop the loop.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("cannot bind to local control interface port")]
    PrimaryPortUnavailable,
}
