use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

/// Errors surfaced by a [`crate::store::TaskStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection-level failure. The caller may retry.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// Malformed predicate, statement or row. Not retried.
    #[error("malformed store operation: {0}")]
    Malformed(String),

    /// The row was not in the expected status (someone else moved it first).
    #[error("claim conflict on {id}: expected {expected}, found {actual}")]
    ClaimConflict {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("{0} not found")]
    NotFound(TaskId),
}

impl StoreError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors surfaced by the command family and its dispatcher.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("duplicate command registration: {0}")]
    DuplicateCommand(String),

    #[error("invalid argument for {command}: {reason}")]
    InvalidArgument {
        command: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
