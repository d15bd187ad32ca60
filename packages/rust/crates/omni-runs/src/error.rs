//! Error taxonomy for run scheduling.
//!
//! Request-validation errors (`*NotFound`, `InvalidRequest`, `InvalidState`)
//! surface synchronously to the caller. Execution-path errors (`Backend`,
//! `ContractViolation`, `TimedOut`, `Cancelled`, `Interrupted`) never escape
//! the dispatch loop: they are recorded on the Run and delivered to waiters
//! as `Execution`.

use thiserror::Error;

use crate::model::RunStatus;

/// Errors produced by the run scheduler and its collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Unknown run id.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Unknown model descriptor id.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Unknown tool contract id.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Malformed request (bad message shape, invalid schema, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not allowed in the run's current state.
    #[error("cannot {operation} run {run_id} while {status}")]
    InvalidState {
        run_id: String,
        status: RunStatus,
        operation: &'static str,
    },

    /// Backend invocation failed (network, provider, malformed response).
    #[error("backend error: {0}")]
    Backend(String),

    /// Structured output expected but absent or not matching the contract.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Execution exceeded the per-run timeout.
    #[error("timed out after {0}s")]
    TimedOut(u64),

    /// Execution cancelled by a collaborator.
    #[error("cancelled")]
    Cancelled,

    /// Run was found `running` with no live execution after a restart.
    #[error("interrupted: run was running when the scheduler restarted")]
    Interrupted,

    /// Terminal error recorded on a run, delivered to `invoke` callers.
    #[error("run {run_id} failed: {error}")]
    Execution { run_id: String, error: String },

    /// Persistence failure in the job store.
    #[error("store error: {0}")]
    Store(String),
}

impl RunError {
    /// Wrap a job store failure, keeping the full context chain.
    pub fn store(error: &anyhow::Error) -> Self {
        Self::Store(format!("{error:#}"))
    }

    /// Wrap a backend failure, keeping the full context chain.
    pub fn backend(error: &anyhow::Error) -> Self {
        Self::Backend(format!("{error:#}"))
    }
}

/// Result type for scheduler operations.
pub type RunResult<T> = std::result::Result<T, RunError>;
