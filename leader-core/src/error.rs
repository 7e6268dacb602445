//! Error types for the leader coordinator
//!
//! Separates errors raised by the coordination layer itself (session,
//! campaign, lifecycle) from errors returned by submitted work.

use std::time::Duration;
use thiserror::Error;

/// Error returned by a leader task, passed through to the caller verbatim
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Primary error type for all coordinator operations
#[derive(Debug, Error)]
pub enum LeaderError {
    // ========== Election Errors ==========

    /// Could not establish a session with the election backend
    #[error("Failed to open election session: {reason}")]
    SessionFailed { reason: String },

    /// The lease backing a session lapsed
    #[error("Election session {lease_id} expired")]
    SessionExpired { lease_id: u64 },

    /// Campaign failed for a reason other than cancellation
    #[error("Campaign for {node} failed: {reason}")]
    Campaign { node: String, reason: String },

    /// Resigning from the election failed
    #[error("Resign failed: {reason}")]
    Resign { reason: String },

    /// The election backend has been shut down
    #[error("Election backend closed")]
    ElectionClosed,

    // ========== Lifecycle Errors ==========

    /// Coordinator used before initialize or after resign
    #[error("Leader coordinator not initialized")]
    NotInitialized,

    /// Coordinator initialized twice without resigning in between
    #[error("Leader coordinator already initialized")]
    AlreadyInitialized,

    /// Supervisor is stopping and no longer accepts work
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// Work result slot was dropped without a value
    #[error("Work {id} was abandoned before producing a result")]
    WorkAbandoned { id: u64 },

    // ========== Work Errors ==========

    /// Error returned by the submitted task
    #[error("{0}")]
    Task(#[source] TaskError),

    /// Task observed cancellation of its leadership generation
    #[error("Work cancelled: leadership lost or coordinator stopping")]
    Cancelled,

    /// Task exceeded its supervised timeout
    #[error("Work timed out after {timeout:?}")]
    TaskTimeout { timeout: Duration },

    // ========== Runtime Errors ==========

    /// Invalid configuration value
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LeaderError {
    /// Returns true if the error was produced by the coordinator rather than the task
    pub fn is_coordination_error(&self) -> bool {
        !matches!(
            self,
            LeaderError::Task(_) | LeaderError::Cancelled | LeaderError::TaskTimeout { .. }
        )
    }

    /// Returns true if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaderError::SessionFailed { .. }
                | LeaderError::SessionExpired { .. }
                | LeaderError::Campaign { .. }
                | LeaderError::Cancelled
        )
    }

    /// Wrap an arbitrary task error
    pub fn task<E>(err: E) -> Self
    where
        E: Into<TaskError>,
    {
        LeaderError::Task(err.into())
    }

    /// Convert a task's error, unwrapping it when it already is a `LeaderError`
    pub fn from_task_error(err: TaskError) -> Self {
        match err.downcast::<LeaderError>() {
            Ok(inner) => *inner,
            Err(other) => LeaderError::Task(other),
        }
    }

    /// Returns true if the error is (or wraps) a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            LeaderError::Cancelled => true,
            LeaderError::Task(inner) => inner
                .downcast_ref::<LeaderError>()
                .is_some_and(LeaderError::is_cancelled),
            _ => false,
        }
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, LeaderError>;
