//! Shared error taxonomy for the proxy core.
//!
//! Internal subsystems return `Result<T, ProxyError>`; only the MCP-facing
//! `ServerHandler` boundary (`src/server`) converts these into
//! `rmcp::ErrorData`, mirroring how the teacher's federation manager does
//! the same conversion at its own boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("server '{0}' is not ready")]
    NotReady(String),

    #[error("server '{0}' is quarantined")]
    Quarantined(String),

    #[error("operation on '{0}' timed out")]
    Timeout(String),

    #[error("upstream error from '{0}': {1}")]
    UpstreamError(String, String),

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("config validation failed: {0}")]
    Validation(String),

    #[error("persistence failed: {0}")]
    PersistFailed(#[from] PersistError),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Errors from the two-phase-commit persistence layer (§4.5).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("kv store error: {0}")]
    Kv(#[from] sled::Error),

    #[error("config serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("config write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
