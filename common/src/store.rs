//! Stateless translator between domain operations and parameterized Connector calls.
//!
//! Grounded on `procrastinate.store.JobStore`: `defer_job` catches the
//! queueing-lock unique violation and turns it into `AlreadyEnqueued`,
//! `fetch_job`/`finish_job` are otherwise thin wrappers, and channel naming
//! follows `get_channel_for_queues`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::connector::{Connector, Param, QueryName, Row, WakeEvent};
use crate::error::{ConnectorError, StoreError};
use crate::job::{
    FinishOutcome, Job, JobStatus, NewJob, EVENT_ABORTED, EVENT_DEFERRED, EVENT_DEFERRED_FOR_RETRY,
    EVENT_FAILED, EVENT_STARTED, EVENT_SUCCEEDED,
};

/// The name of the unique partial index on `queueing_lock WHERE status = 'todo'`.
/// `defer_job` recognizes a violation of exactly this constraint as `AlreadyEnqueued`;
/// any other unique violation propagates as a plain `ConnectorError`.
pub const QUEUEING_LOCK_CONSTRAINT: &str = "jobs_queueing_lock_idx";

/// A queue's notification channel, or the wildcard channel subscribing to all queues.
pub fn channels_for_queues(prefix: &str, queues: &[String]) -> Vec<String> {
    if queues.is_empty() {
        vec![format!("{prefix}_any_queue")]
    } else {
        queues
            .iter()
            .map(|q| format!("{prefix}_queue#{q}"))
            .collect()
    }
}

/// Aggregated job counts for `list_queues`/`list_tasks`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregateCount {
    pub key: String,
    pub status: String,
    pub job_count: i64,
}

pub struct JobStore {
    connector: Arc<dyn Connector>,
    channel_prefix: String,
}

impl JobStore {
    pub fn new(connector: Arc<dyn Connector>, channel_prefix: impl Into<String>) -> Self {
        Self {
            connector,
            channel_prefix: channel_prefix.into(),
        }
    }

    pub fn channel_prefix(&self) -> &str {
        &self.channel_prefix
    }

    fn row_to_job(row: &Row) -> Job {
        Job {
            id: row.get_i64("id").expect("fetched job row has id"),
            queue: row.get_str("queue").unwrap_or_default().to_owned(),
            task_name: row.get_str("task_name").unwrap_or_default().to_owned(),
            args: row.get("args").cloned().unwrap_or(Value::Null),
            lock: row
                .get("lock")
                .and_then(|v| v.as_str().map(str::to_owned)),
            queueing_lock: row
                .get("queueing_lock")
                .and_then(|v| v.as_str().map(str::to_owned)),
            status: row
                .get_str("status")
                .and_then(|s| s.parse().ok())
                .unwrap_or(JobStatus::Todo),
            scheduled_at: row.get_timestamp("scheduled_at"),
            attempts: row.get_i32("attempts").unwrap_or(0),
            updated_at: row.get_timestamp("updated_at").unwrap_or_else(Utc::now),
        }
    }

    /// Insert a `todo` job. Fails with `AlreadyEnqueued` if `queueing_lock` collides
    /// with an existing `todo` row, and emits a notification on the job's queue
    /// channel (and the wildcard channel) on success.
    pub async fn defer_job(&self, job: NewJob) -> Result<i64, StoreError> {
        let params = [
            Param::Text(job.queue.clone()),
            Param::Text(job.task_name.clone()),
            Param::Json(job.args.clone()),
            Param::OptText(job.lock.clone()),
            Param::OptText(job.queueing_lock.clone()),
            Param::OptTimestamp(job.scheduled_at),
        ];

        let row = match self
            .connector
            .execute_query_one(QueryName::DeferJob, &params)
            .await
        {
            Ok(row) => row,
            Err(ConnectorError::UniqueViolation { constraint_name })
                if constraint_name == QUEUEING_LOCK_CONSTRAINT =>
            {
                return Err(StoreError::AlreadyEnqueued {
                    queueing_lock: job.queueing_lock,
                });
            }
            Err(other) => return Err(other.into()),
        };

        let id = row.get_i64("id").expect("DeferJob returns the new id");
        self.record_event(id, EVENT_DEFERRED).await.ok();
        Ok(id)
    }

    /// Atomically transition the next eligible `todo` job in `queues` (or any queue,
    /// if `queues` is empty) to `doing` and return it.
    pub async fn fetch_job(&self, queues: &[String]) -> Result<Option<Job>, StoreError> {
        let params = [Param::TextArray(queues.to_vec())];
        let row = self
            .connector
            .execute_query_maybe_one(QueryName::FetchJob, &params)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let job = Self::row_to_job(&row);
                self.record_event(job.id, EVENT_STARTED).await.ok();
                Ok(Some(job))
            }
        }
    }

    /// Commit a terminal outcome for a `doing` job. Idempotent: calling this twice
    /// with the same outcome on an already-terminal job is a silent no-op.
    pub async fn finish_job(&self, job_id: i64, outcome: FinishOutcome) -> Result<(), StoreError> {
        let params = [
            Param::BigInt(job_id),
            Param::Text(outcome.status().as_str().to_owned()),
            Param::OptTimestamp(None),
        ];
        self.connector
            .execute_query(QueryName::FinishJob, &params)
            .await?;
        let event = match outcome {
            FinishOutcome::Succeeded => EVENT_SUCCEEDED,
            FinishOutcome::Failed => EVENT_FAILED,
        };
        self.record_event(job_id, event).await.ok();
        Ok(())
    }

    /// Reschedule a `doing` job back to `todo` with a new `scheduled_at`, the retry path.
    pub async fn retry_job(&self, job_id: i64, scheduled_at: DateTime<Utc>) -> Result<(), StoreError> {
        let params = [
            Param::BigInt(job_id),
            Param::Text(JobStatus::Failed.as_str().to_owned()),
            Param::OptTimestamp(Some(scheduled_at)),
        ];
        self.connector
            .execute_query(QueryName::FinishJob, &params)
            .await?;
        self.record_event(job_id, EVENT_DEFERRED_FOR_RETRY).await.ok();
        Ok(())
    }

    /// Mark a job `failed` with no retry, as requested by the task body itself
    /// (`JobAborted`), distinct from an unexpected panic.
    pub async fn abort_job(&self, job_id: i64) -> Result<(), StoreError> {
        self.finish_job(job_id, FinishOutcome::Failed).await?;
        self.record_event(job_id, EVENT_ABORTED).await.ok();
        Ok(())
    }

    /// Admin-triggered retry of an already-`failed` job. Unlike `retry_job` (called
    /// by the worker from `doing`), this requires the job to currently be `failed`
    /// and errors otherwise — the query's `WHERE status = 'failed'` guard is what
    /// rejects a `succeeded -> todo` transition.
    pub async fn retry_failed_job(
        &self,
        job_id: i64,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let params = [Param::BigInt(job_id), Param::OptTimestamp(scheduled_at)];
        match self
            .connector
            .execute_query_maybe_one(QueryName::RetryJob, &params)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(StoreError::IllegalTransition {
                job_id,
                from: "succeeded|todo|doing".to_owned(),
                to: "todo".to_owned(),
            }),
        }
    }

    /// All jobs in `doing` whose last update is older than `threshold_seconds`.
    /// Monitoring only; never mutates.
    pub async fn get_stalled_jobs(&self, threshold_seconds: i64) -> Result<Vec<Job>, StoreError> {
        let params = [Param::Int(threshold_seconds as i32)];
        let rows = self
            .connector
            .execute_query_all(QueryName::GetStalledJobs, &params)
            .await?;
        Ok(rows.iter().map(Self::row_to_job).collect())
    }

    /// Remove terminal jobs older than `threshold_hours`. Never touches `todo` or
    /// `doing` rows — the query only ever targets `succeeded` (and, if requested,
    /// `failed`) statuses.
    pub async fn delete_old_jobs(
        &self,
        threshold_hours: i64,
        queue: Option<&str>,
        include_failed: bool,
    ) -> Result<(), StoreError> {
        let params = [
            Param::Int(threshold_hours as i32),
            Param::OptText(queue.map(str::to_owned)),
            Param::Bool(include_failed),
        ];
        self.connector
            .execute_query(QueryName::DeleteOldJobs, &params)
            .await?;
        Ok(())
    }

    /// Read-only admin query: list jobs matching the given optional filters.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_jobs(
        &self,
        id: Option<i64>,
        queue: Option<&str>,
        task_name: Option<&str>,
        status: Option<&str>,
        lock: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let params = [
            Param::OptBigInt(id),
            Param::OptText(queue.map(str::to_owned)),
            Param::OptText(task_name.map(str::to_owned)),
            Param::OptText(status.map(str::to_owned)),
            Param::OptText(lock.map(str::to_owned)),
        ];
        let rows = self
            .connector
            .execute_query_all(QueryName::ListJobs, &params)
            .await?;
        Ok(rows.iter().map(Self::row_to_job).collect())
    }

    pub async fn list_queues(&self) -> Result<Vec<AggregateCount>, StoreError> {
        let rows = self
            .connector
            .execute_query_all(QueryName::ListQueues, &[])
            .await?;
        Ok(rows
            .iter()
            .map(|r| AggregateCount {
                key: r.get_str("queue").unwrap_or_default().to_owned(),
                status: r.get_str("status").unwrap_or_default().to_owned(),
                job_count: r.get_i64("job_count").unwrap_or(0),
            })
            .collect())
    }

    pub async fn list_tasks(&self) -> Result<Vec<AggregateCount>, StoreError> {
        let rows = self
            .connector
            .execute_query_all(QueryName::ListTasks, &[])
            .await?;
        Ok(rows
            .iter()
            .map(|r| AggregateCount {
                key: r.get_str("task_name").unwrap_or_default().to_owned(),
                status: r.get_str("status").unwrap_or_default().to_owned(),
                job_count: r.get_i64("job_count").unwrap_or(0),
            })
            .collect())
    }

    /// Operator override: force a job's status regardless of the normal state
    /// machine. Used for manual recovery of stalled jobs.
    pub async fn set_job_status(&self, job_id: i64, status: JobStatus) -> Result<(), StoreError> {
        let params = [
            Param::BigInt(job_id),
            Param::Text(status.as_str().to_owned()),
        ];
        match self
            .connector
            .execute_query_maybe_one(QueryName::SetJobStatus, &params)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    /// Subscribe to the notification channels for `queues` (all queues, if empty),
    /// signalling `event` forever until cancelled.
    pub async fn listen(&self, event: WakeEvent, queues: &[String]) -> Result<(), StoreError> {
        let channels = channels_for_queues(&self.channel_prefix, queues);
        self.connector.listen_notify(event, &channels).await?;
        Ok(())
    }

    async fn record_event(&self, job_id: i64, event_type: &str) -> Result<(), StoreError> {
        let params = [Param::BigInt(job_id), Param::Text(event_type.to_owned())];
        self.connector
            .execute_query(QueryName::InsertJobEvent, &params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::InMemoryConnector;
    use crate::job::JobStatus;

    fn store() -> JobStore {
        JobStore::new(Arc::new(InMemoryConnector::new()), "procrastinate")
    }

    #[tokio::test]
    async fn defer_then_fetch_round_trips_every_attribute_but_id_status_attempts() {
        let store = store();
        let new_job = NewJob::new("sum_task", "default", serde_json::json!({"a": 1, "b": 2}))
            .with_lock("lock-a");

        let id = store.defer_job(new_job.clone()).await.unwrap();
        let job = store.fetch_job(&[]).await.unwrap().unwrap();

        assert_eq!(job.id, id);
        assert_eq!(job.queue, new_job.queue);
        assert_eq!(job.task_name, new_job.task_name);
        assert_eq!(job.args, new_job.args);
        assert_eq!(job.lock, new_job.lock);
        assert_eq!(job.status, JobStatus::Doing);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn fetch_respects_queue_filter() {
        let store = store();
        store
            .defer_job(NewJob::new("product_task", "product_queue", serde_json::json!({})))
            .await
            .unwrap();

        assert!(store.fetch_job(&["default".to_owned()]).await.unwrap().is_none());
        assert!(store
            .fetch_job(&["product_queue".to_owned()])
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn finish_job_is_idempotent() {
        let store = store();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})))
            .await
            .unwrap();
        let job = store.fetch_job(&[]).await.unwrap().unwrap();

        store.finish_job(job.id, FinishOutcome::Succeeded).await.unwrap();
        // A second call against an already-terminal job is a silent no-op, not an error.
        store.finish_job(job.id, FinishOutcome::Succeeded).await.unwrap();

        let reloaded = store
            .list_jobs(Some(job.id), None, None, None, None)
            .await
            .unwrap();
        assert_eq!(reloaded[0].status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn queueing_lock_rejects_a_second_pending_job() {
        let store = store();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})).with_queueing_lock("q"))
            .await
            .unwrap();

        let result = store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})).with_queueing_lock("q"))
            .await;

        assert!(matches!(result, Err(StoreError::AlreadyEnqueued { .. })));
    }

    #[tokio::test]
    async fn queueing_lock_is_released_once_the_first_job_leaves_todo() {
        let store = store();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})).with_queueing_lock("q"))
            .await
            .unwrap();
        store.fetch_job(&[]).await.unwrap();

        // The first job is now `doing`, so the queueing lock (which only guards
        // `todo` rows) no longer blocks a second enqueue.
        let second = store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})).with_queueing_lock("q"))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn fetch_excludes_a_job_whose_lock_is_held_by_a_doing_job() {
        let store = store();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})).with_lock("shared"))
            .await
            .unwrap();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})).with_lock("shared"))
            .await
            .unwrap();

        let first = store.fetch_job(&[]).await.unwrap();
        assert!(first.is_some());

        // The second job shares the lock with the first, which is still `doing`.
        let second = store.fetch_job(&[]).await.unwrap();
        assert!(second.is_none());

        store
            .finish_job(first.unwrap().id, FinishOutcome::Succeeded)
            .await
            .unwrap();
        let third = store.fetch_job(&[]).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn retry_job_resets_a_doing_job_to_todo_with_a_new_schedule() {
        let store = store();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})))
            .await
            .unwrap();
        let job = store.fetch_job(&[]).await.unwrap().unwrap();

        let scheduled_at = Utc::now() + chrono::Duration::seconds(30);
        store.retry_job(job.id, scheduled_at).await.unwrap();

        let reloaded = store
            .list_jobs(Some(job.id), None, None, None, None)
            .await
            .unwrap();
        assert_eq!(reloaded[0].status, JobStatus::Todo);
        assert!(store.fetch_job(&[]).await.unwrap().is_none()); // not eligible yet
    }

    #[tokio::test]
    async fn delete_old_jobs_never_removes_todo_or_doing() {
        let store = store();
        store
            .defer_job(NewJob::new("t", "default", serde_json::json!({})))
            .await
            .unwrap();
        store
            .defer_job(NewJob::new("t2", "default", serde_json::json!({})))
            .await
            .unwrap();
        store.fetch_job(&[]).await.unwrap(); // second job now `doing`

        store.delete_old_jobs(0, None, true).await.unwrap();

        let remaining = store.list_jobs(None, None, None, None, None).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn channels_for_all_queues_is_the_wildcard_channel() {
        assert_eq!(
            channels_for_queues("procrastinate", &[]),
            vec!["procrastinate_any_queue".to_owned()]
        );
    }

    #[test]
    fn channels_for_specific_queues_use_the_per_queue_naming() {
        assert_eq!(
            channels_for_queues("procrastinate", &["emails".to_owned()]),
            vec!["procrastinate_queue#emails".to_owned()]
        );
    }
}
