//! Error types for the triage guard.

use thiserror::Error;

/// Top-level error type returned by fallible guard operations.
///
/// The per-message hot path (`ThrallGuard::on_mail_received`) never
/// propagates these past its own boundary: it logs and swallows, per the
/// inbound hook's "always returns normally" contract. Internal
/// components still return `Result` so failures are explicit and
/// testable in isolation.
#[derive(Debug, Error)]
pub enum ThrallError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("breaker error: {0}")]
    Breaker(String),

    #[error("admin error: {0}")]
    Admin(String),
}

/// Errors from the embedded database layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutting down, write rejected")]
    ShuttingDown,
}

/// Errors from a model backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("model previously failed to load")]
    PreviouslyFailed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

pub type ThrallResult<T> = Result<T, ThrallError>;
