//! The [`Job`] entity and its state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// `todo -> doing -> {succeeded, failed}`, with an explicit `failed -> todo` retry edge.
/// `succeeded` is terminal: nothing transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Todo,
    Doing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Todo => "todo",
            JobStatus::Doing => "doing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(JobStatus::Todo),
            "doing" => Ok(JobStatus::Doing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(ConnectorError::QueryError {
                query: "parse job_status".to_owned(),
                error: sqlx::Error::Decode(format!("{invalid} is not a valid job_status").into()),
            }),
        }
    }
}

/// Arbitrary JSON-representable payload handed to a task body.
pub type JobArgs = serde_json::Value;

/// A job as stored in the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub task_name: String,
    pub args: JobArgs,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub status: JobStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub updated_at: DateTime<Utc>,
}

/// A not-yet-persisted job, as handed to `defer_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    pub task_name: String,
    pub args: JobArgs,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>, args: JobArgs) -> Self {
        Self {
            queue: queue.into(),
            task_name: task_name.into(),
            args,
            lock: None,
            queueing_lock: None,
            scheduled_at: None,
        }
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_queueing_lock(mut self, queueing_lock: impl Into<String>) -> Self {
        self.queueing_lock = Some(queueing_lock.into());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// The outcome `finish_job` should record for a `doing` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Succeeded,
    Failed,
}

impl FinishOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            FinishOutcome::Succeeded => JobStatus::Succeeded,
            FinishOutcome::Failed => JobStatus::Failed,
        }
    }
}

/// One row of the `job_events` audit table. Never consulted by the engine itself,
/// only by admin read queries and by tests asserting transition order.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobEvent {
    pub job_id: i64,
    pub event_type: String,
    pub at: DateTime<Utc>,
}

pub const EVENT_DEFERRED: &str = "deferred";
pub const EVENT_STARTED: &str = "started";
pub const EVENT_DEFERRED_FOR_RETRY: &str = "deferred_for_retry";
pub const EVENT_FAILED: &str = "failed";
pub const EVENT_SUCCEEDED: &str = "succeeded";
pub const EVENT_ABORTED: &str = "aborted";
