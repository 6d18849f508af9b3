//! Error types used by the officevisor pool and tasks.
//!
//! This module defines two main error enums:
//!
//! - [`OfficeError`] — errors raised by the pool, the per-worker supervisors,
//!   and the bridge layer.
//! - [`TaskError`] — errors raised by individual task executions.
//!
//! Both types provide an `as_label` helper for logging/metrics. Errors raised
//! on synchronous caller-facing paths (`OfficePool::execute`, fail-fast start)
//! propagate to the caller; errors during asynchronous recovery are logged by
//! the lifecycle actor and never surface to a caller.

use std::time::Duration;
use thiserror::Error;

use crate::transport::BridgeError;

/// # Errors produced by the pool and the per-worker supervisors.
///
/// These represent failures of the supervision machinery itself: a worker that
/// would not start or stop, a bridge that could not be established, a task that
/// overran its budget, or a misused pool lifecycle.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum OfficeError {
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        message: String,
    },

    /// The worker process could not be spawned, its PID was never found, or it
    /// died before a bridge connection was established.
    #[error("office process start failed: {message}")]
    Start {
        /// Details of the start failure.
        message: String,
    },

    /// A bridge connection attempt failed.
    ///
    /// Whether this is temporary or fatal depends on the worker process: a
    /// connect failure with the process still alive is retried, one with the
    /// process confirmed dead aborts the start.
    #[error("bridge connect failed: {source}")]
    Connect {
        /// The underlying bridge failure.
        #[source]
        source: BridgeError,
    },

    /// A worker already occupies the target address and the configured policy
    /// is [`ExistingProcessAction::Fail`](crate::ExistingProcessAction::Fail).
    #[error("a process already accepts connections on '{url}'")]
    ExistingProcess {
        /// The contested connect address.
        url: String,
    },

    /// A task did not complete within the configured execution timeout.
    ///
    /// The worker is forcibly restarted as a side effect.
    #[error("task did not complete within {} ms", timeout.as_millis())]
    TaskTimeout {
        /// The execution timeout that was exceeded.
        timeout: Duration,
    },

    /// The task body itself failed; wraps the task's own error.
    #[error("task execution failed: {source}")]
    Task {
        /// The task's own failure.
        #[source]
        source: TaskError,
    },

    /// The task executor went away before reporting a result.
    #[error("task interrupted before completion")]
    TaskInterrupted,

    /// No pool entry became available within the queue timeout.
    #[error("no office worker became available within {} ms", timeout.as_millis())]
    NoEntryAvailable {
        /// The configured queue timeout.
        timeout: Duration,
    },

    /// A retried operation exhausted its time budget.
    #[error("giving up after {elapsed:?}: {source}")]
    RetryTimeout {
        /// Time spent retrying before giving up.
        elapsed: Duration,
        /// The last temporary failure observed.
        #[source]
        source: Box<OfficeError>,
    },

    /// The worker process would not terminate within the retry/timeout window.
    #[error("office process stop failed: {message}")]
    Stop {
        /// Details of the stop failure.
        message: String,
    },

    /// The pool has not been started yet.
    #[error("office pool is not started")]
    NotStarted,

    /// The pool is already running.
    #[error("office pool is already started")]
    AlreadyStarted,

    /// The pool was shut down; shutdown is terminal.
    #[error("office pool has been shut down")]
    AlreadyShutdown,

    /// The operation was aborted by cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl OfficeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use officevisor::OfficeError;
    ///
    /// let err = OfficeError::NoEntryAvailable { timeout: Duration::from_secs(30) };
    /// assert_eq!(err.as_label(), "no_entry_available");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            OfficeError::InvalidConfig { .. } => "invalid_config",
            OfficeError::Start { .. } => "start_failed",
            OfficeError::Connect { .. } => "connect_failed",
            OfficeError::ExistingProcess { .. } => "existing_process",
            OfficeError::TaskTimeout { .. } => "task_timeout",
            OfficeError::Task { .. } => "task_failed",
            OfficeError::TaskInterrupted => "task_interrupted",
            OfficeError::NoEntryAvailable { .. } => "no_entry_available",
            OfficeError::RetryTimeout { .. } => "retry_timeout",
            OfficeError::Stop { .. } => "stop_failed",
            OfficeError::NotStarted => "not_started",
            OfficeError::AlreadyStarted => "already_started",
            OfficeError::AlreadyShutdown => "already_shutdown",
            OfficeError::Cancelled => "cancelled",
        }
    }

    /// Indicates whether the caller may simply try again later.
    ///
    /// Returns `true` for queue exhaustion and task timeouts, where the pool
    /// recovers on its own and a later submission is expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OfficeError::NoEntryAvailable { .. } | OfficeError::TaskTimeout { .. }
        )
    }
}

/// # Errors produced by task execution.
///
/// These represent failures of the task body itself, as opposed to failures of
/// the supervision machinery around it. The pool reports them wrapped in
/// [`OfficeError::Task`] and does not restart the worker for them.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Task execution failed but a fresh submission may succeed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Non-recoverable failure; resubmitting the same task is pointless.
    #[error("fatal error (no retry): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// The task was cancelled, either by worker loss or by pool shutdown.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use officevisor::TaskError;
    ///
    /// let err = TaskError::Fail { error: "boom".into() };
    /// assert_eq!(err.as_label(), "task_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Fail { .. } => "task_failed",
            TaskError::Fatal { .. } => "task_fatal",
            TaskError::Cancelled => "task_cancelled",
        }
    }

    /// Indicates whether the error type is safe to retry.
    ///
    /// # Example
    /// ```
    /// use officevisor::TaskError;
    ///
    /// let retryable = TaskError::Fail { error: "boom".into() };
    /// assert!(retryable.is_retryable());
    ///
    /// let fatal = TaskError::Fatal { error: "nope".into() };
    /// assert!(!fatal.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Fail { .. })
    }
}
