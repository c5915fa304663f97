//! Error taxonomy shared by every dockyard crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed generation, detected before any build starts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Clone/fetch of the service source failed.
    #[error("source retrieval failed: {0}")]
    SourceRetrieval(String),

    /// Build executor exited non-zero. `output` holds the tail of the
    /// captured process output.
    #[error("build failed: {message}")]
    BuildFailed { message: String, output: String },

    /// The orchestrator rejected the stack or an orchestrator call failed.
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
