//! Error types for the scheduling engine

use std::any::Any;

/// Errors surfaced to callers of the engine
///
/// Contention failures (failed steals, failed switches) never show up here:
/// they are retried internally and only counted in [`crate::SchedulerStats`].
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// Work was submitted after `shutdown()` began
    #[error("Submission rejected: engine is shutting down")]
    Rejected,

    /// Operation is deliberately not supported
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Control group built with a non-positive quota or period
    #[error("Invalid quota: quota={quota}ns period={period}ns")]
    InvalidQuota {
        /// Requested quota in nanoseconds
        quota: i64,
        /// Requested period in nanoseconds
        period: i64,
    },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read a configuration file
    #[error("Failed to read configuration: {0}")]
    ConfigRead(#[source] std::io::Error),

    /// Failed to parse a configuration file
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to spawn an OS thread (carrier or task context)
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Event pump reported an error
    #[error("Event pump error: {0}")]
    EventPump(#[source] std::io::Error),

    /// Operation requires a task context but was called from a bare thread
    #[error("Operation requires a task context")]
    NotInTask,

    /// A task may belong to at most one control group
    #[error("Task is already attached to a control group")]
    AlreadyAttached,

    /// A bounded wait elapsed
    #[error("Timed out")]
    Timeout,
}

/// Result alias used across the engine
pub type SchedResult<T> = Result<T, SchedError>;

/// Why a unit of work did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// The work was cancelled before it finished
    #[error("task was cancelled")]
    Cancelled,

    /// The work panicked
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Unwind payload used to force a task into its terminal path
#[derive(Debug)]
pub(crate) struct TaskCancelled;

/// Unwind payload used when a suspended context is discarded
#[derive(Debug)]
pub(crate) struct ContextDiscarded;

impl JoinError {
    /// Classify a caught unwind payload
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if payload.is::<TaskCancelled>() || payload.is::<ContextDiscarded>() {
            return JoinError::Cancelled;
        }
        if let Some(msg) = payload.downcast_ref::<&'static str>() {
            return JoinError::Panicked((*msg).to_string());
        }
        match payload.downcast::<String>() {
            Ok(msg) => JoinError::Panicked(*msg),
            Err(_) => JoinError::Panicked("non-string panic payload".to_string()),
        }
    }
}
