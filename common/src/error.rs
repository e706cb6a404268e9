//! Error taxonomy shared by the connector and job store layers.

use thiserror::Error;

/// Errors surfaced by a [`crate::connector::Connector`] implementation.
///
/// A unique-constraint violation is always reported as [`ConnectorError::UniqueViolation`]
/// so the store can decide, one layer up, whether the violated constraint means
/// something domain-specific (the queueing lock) or should simply propagate.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("connection to the database failed: {error}")]
    ConnectionError { error: sqlx::Error },

    #[error("{query} query failed: {error}")]
    QueryError { query: String, error: sqlx::Error },

    #[error("{query} expected exactly one row but none was returned")]
    NoRowReturned { query: String },

    #[error("unique constraint {constraint_name} was violated")]
    UniqueViolation { constraint_name: String },

    #[error("connector is closed")]
    Closed,
}

/// Errors surfaced by the [`crate::store::JobStore`] to its callers (the worker, the CLI).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// A `defer_job` call collided with a live `queueing_lock`.
    #[error("a job with queueing lock {queueing_lock:?} is already awaiting execution")]
    AlreadyEnqueued { queueing_lock: Option<String> },

    /// `set_job_status` or `finish_job` was asked to perform a transition the
    /// state machine does not allow (e.g. `succeeded -> todo`).
    #[error("cannot transition job {job_id} from {from} to {to}")]
    IllegalTransition {
        job_id: i64,
        from: String,
        to: String,
    },

    #[error("job {0} does not exist")]
    JobNotFound(i64),
}

/// Errors arising while a worker dispatches and runs a job.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// The job's `task_name` has no entry in the [`crate::job::TaskRegistry`] the worker
    /// was started with.
    #[error("no task registered under the name {0:?}")]
    TaskNotFound(String),

    #[error("timed out waiting for the worker pool to drain")]
    ShutdownTimeout,
}

/// A sentinel a task body returns to request a specific terminal or rescheduled
/// outcome for the job currently executing, rather than a plain success.
///
/// Unlike [`WorkerError`] this is not a failure of the engine: it's the task's own
/// verdict on its execution, analogous to a Python task raising `JobAborted` or
/// `JobRetry` from inside `@task`-decorated code.
#[derive(Error, Debug)]
pub enum TaskOutcome {
    /// The task asks to be marked `failed` with no retry, and without the traceback
    /// being logged at `ERROR` level the way an unexpected panic would be.
    #[error("job aborted: {0}")]
    JobAborted(String),

    /// The task asks to be rescheduled. Carries an optional interval the task would
    /// prefer to wait (e.g. a `Retry-After` style hint); the worker's [`crate::retry::RetryPolicy`]
    /// turns this into a `scheduled_at` and is also what enforces the attempt ceiling,
    /// so the task itself never computes backoff or counts its own attempts.
    #[error("job requested a retry")]
    JobRetry { preferred_retry_interval: Option<std::time::Duration> },

    /// The task panicked or returned a plain error; treated as an ordinary failure.
    #[error("task failed: {0}")]
    Failed(String),
}

/// Raised internally once the worker's shutdown handler has observed a signal and
/// fetch loops should stop pulling new work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stop requested")]
pub struct StopRequested;
