//! Error types for the database layer.

use thiserror::Error;
use vigil_protocol::{InvalidTransition, JobId, RunId, RunStatus, WorkerId};

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation (unique, foreign key, etc.)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Edge not allowed by the run state machine (includes any edge out of a
    /// terminal state).
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Optimistic check failed: the run moved on since the caller read it.
    #[error("Stale transition on run {run_id}: expected {expected}, found {actual}")]
    StaleTransition {
        run_id: RunId,
        expected: RunStatus,
        actual: RunStatus,
    },

    /// The worker no longer holds the lease on this job.
    #[error("Lease on job {job_id} is not held by {worker}")]
    LeaseLost { job_id: JobId, worker: WorkerId },

    /// Stored value could not be decoded into a domain type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a constraint error.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// True when a concurrent writer won; callers usually re-read and give up.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DbError::StaleTransition { .. } | DbError::LeaseLost { .. }
        )
    }
}
