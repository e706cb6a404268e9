//! A single fetch/dispatch/finish loop.
//!
//! A worker process runs `concurrency` of these concurrently (see
//! [`crate::app::App`]), each independently cycling through
//! `fetch_job -> dispatch -> finish_job`, idling on the shared [`WakeEvent`]
//! between empty fetches. This replaces the semaphore-gated spawn-per-job pool
//! the original webhook worker used: here a fixed number of long-lived loops is
//! what gives the process its concurrency, not a bound on concurrently spawned
//! tasks.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use queue_common::connector::WakeEvent;
use queue_common::job::{FinishOutcome, Job};
use queue_common::retry::RetryPolicy;
use queue_common::{JobStore, TaskOutcome};
use tokio_util::sync::CancellationToken;

use crate::registry::{TaskContext, TaskFuture, TaskRegistry};
use queue_common::health::HealthHandle;

/// One cooperative fetch/dispatch/finish loop.
pub struct Worker {
    pub id: usize,
    pub store: Arc<JobStore>,
    pub registry: Arc<TaskRegistry>,
    pub queues: Vec<String>,
    pub poll_interval: StdDuration,
    pub wake: WakeEvent,
    pub liveness: HealthHandle,
    /// Governs the `scheduled_at` computed for a `TaskOutcome::JobRetry`.
    pub retry_policy: RetryPolicy,
    /// A job that has already reached this many attempts is failed terminally
    /// instead of retried again, regardless of what the task body requested.
    pub max_attempts: u32,
    /// Stop pulling new jobs. In-flight work is allowed to finish.
    pub soft_shutdown: CancellationToken,
    /// Abandon in-flight work immediately.
    pub hard_shutdown: CancellationToken,
}

impl Worker {
    pub async fn run(self) {
        loop {
            if self.soft_shutdown.is_cancelled() {
                tracing::debug!(worker_id = self.id, "soft shutdown observed, stopping");
                return;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.hard_shutdown.cancelled() => return,
                res = self.store.fetch_job(&self.queues) => res,
            };

            match fetched {
                Ok(Some(job)) => {
                    self.liveness.report_healthy().await;
                    self.dispatch(job).await;
                }
                Ok(None) => {
                    self.liveness.report_healthy().await;
                    self.idle_wait().await;
                }
                Err(err) => {
                    tracing::error!(worker_id = self.id, error = %err, "fetch_job failed, backing off");
                    tokio::select! {
                        _ = self.hard_shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn idle_wait(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.soft_shutdown.cancelled() => {}
        }
    }

    async fn dispatch(&self, job: Job) {
        let Some(task) = self.registry.lookup(&job.task_name) else {
            tracing::error!(
                worker_id = self.id,
                job_id = job.id,
                task_name = %job.task_name,
                "no task registered under this name, marking failed"
            );
            if let Err(err) = self.store.finish_job(job.id, FinishOutcome::Failed).await {
                tracing::error!(job_id = job.id, error = %err, "failed to record TaskNotFound outcome");
            }
            return;
        };

        let ctx = TaskContext {
            job_id: job.id,
            attempts: job.attempts,
            args: job.args.clone(),
        };

        metrics::counter!("queue_jobs_started_total", "queue" => job.queue.clone(), "task" => job.task_name.clone())
            .increment(1);
        let started = std::time::Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.hard_shutdown.cancelled() => {
                tracing::warn!(
                    worker_id = self.id,
                    job_id = job.id,
                    "hard shutdown requested mid-job, abandoning (job stays 'doing')"
                );
                return;
            }
            result = (task.func)(ctx) => result,
        };

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("queue_job_duration_seconds", "queue" => job.queue.clone(), "task" => job.task_name.clone())
            .record(elapsed);

        self.record_outcome(&job, outcome).await;
    }

    async fn record_outcome(&self, job: &Job, outcome: Result<(), TaskOutcome>) {
        let result = match outcome {
            Ok(()) => self.store.finish_job(job.id, FinishOutcome::Succeeded).await,
            Err(TaskOutcome::JobAborted(reason)) => {
                tracing::warn!(job_id = job.id, reason, "task aborted job, no retry");
                self.store.abort_job(job.id).await
            }
            Err(TaskOutcome::JobRetry { preferred_retry_interval }) => {
                if job.attempts as u32 >= self.max_attempts {
                    tracing::error!(
                        job_id = job.id,
                        attempts = job.attempts,
                        max_attempts = self.max_attempts,
                        "task requested retry but the attempt ceiling was already reached, failing terminally"
                    );
                    metrics::counter!("queue_jobs_failed_total", "queue" => job.queue.clone(), "task" => job.task_name.clone())
                        .increment(1);
                    self.store.finish_job(job.id, FinishOutcome::Failed).await
                } else {
                    let delay = self
                        .retry_policy
                        .time_until_next_retry(job.attempts as u32 - 1, preferred_retry_interval);
                    let scheduled_at = now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    tracing::info!(job_id = job.id, %scheduled_at, "task requested retry");
                    metrics::counter!("queue_jobs_retried_total", "queue" => job.queue.clone(), "task" => job.task_name.clone())
                        .increment(1);
                    self.store.retry_job(job.id, scheduled_at).await
                }
            }
            Err(TaskOutcome::Failed(reason)) => {
                tracing::error!(job_id = job.id, error = reason, "task failed");
                metrics::counter!("queue_jobs_failed_total", "queue" => job.queue.clone(), "task" => job.task_name.clone())
                    .increment(1);
                self.store.finish_job(job.id, FinishOutcome::Failed).await
            }
        };

        if result.is_ok() {
            metrics::counter!("queue_jobs_succeeded_total", "queue" => job.queue.clone(), "task" => job.task_name.clone())
                .increment(1);
        } else if let Err(err) = result {
            tracing::error!(job_id = job.id, error = %err, "failed to record job outcome");
        }
    }
}

/// `Utc::now` indirection kept purely so call sites that compute a retry
/// `scheduled_at` read as intent rather than a raw clock call.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_common::connector::InMemoryConnector;
    use queue_common::health::HealthRegistry;
    use queue_common::job::{JobStatus, NewJob};

    async fn test_worker(registry: TaskRegistry) -> (Worker, Arc<JobStore>) {
        let store = Arc::new(JobStore::new(Arc::new(InMemoryConnector::new()), "procrastinate"));
        let liveness = HealthRegistry::new("test")
            .register("worker".to_owned(), time::Duration::seconds(60))
            .await;
        let worker = Worker {
            id: 0,
            store: store.clone(),
            registry: Arc::new(registry),
            queues: vec![],
            poll_interval: StdDuration::from_millis(10),
            wake: Arc::new(tokio::sync::Notify::new()),
            liveness,
            retry_policy: RetryPolicy::default(),
            max_attempts: 10,
            soft_shutdown: CancellationToken::new(),
            hard_shutdown: CancellationToken::new(),
        };
        (worker, store)
    }

    async fn fetched_job(store: &JobStore, task_name: &str) -> Job {
        store
            .defer_job(NewJob::new(task_name, "default", serde_json::json!({"a": 1})))
            .await
            .unwrap();
        store.fetch_job(&[]).await.unwrap().unwrap()
    }

    fn status_of(store_jobs: &[Job], id: i64) -> JobStatus {
        store_jobs.iter().find(|j| j.id == id).unwrap().status
    }

    #[tokio::test]
    async fn dispatch_marks_an_unknown_task_name_as_failed() {
        let (worker, store) = test_worker(TaskRegistry::new()).await;
        let job = fetched_job(&store, "nonexistent").await;

        worker.dispatch(job.clone()).await;

        let jobs = store.list_jobs(Some(job.id), None, None, None, None).await.unwrap();
        assert_eq!(status_of(&jobs, job.id), JobStatus::Failed);
    }

    #[tokio::test]
    async fn dispatch_finishes_successfully_on_ok() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "ok_task",
            "default",
            Arc::new(|_ctx: TaskContext| -> TaskFuture { Box::pin(async { Ok(()) }) }),
        );
        let (worker, store) = test_worker(registry).await;
        let job = fetched_job(&store, "ok_task").await;

        worker.dispatch(job.clone()).await;

        let jobs = store.list_jobs(Some(job.id), None, None, None, None).await.unwrap();
        assert_eq!(status_of(&jobs, job.id), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn dispatch_reschedules_to_todo_on_job_retry() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "retry_task",
            "default",
            Arc::new(|_ctx: TaskContext| -> TaskFuture {
                Box::pin(async {
                    Err(TaskOutcome::JobRetry {
                        preferred_retry_interval: None,
                    })
                })
            }),
        );
        let (worker, store) = test_worker(registry).await;
        let job = fetched_job(&store, "retry_task").await;

        worker.dispatch(job.clone()).await;

        let jobs = store.list_jobs(Some(job.id), None, None, None, None).await.unwrap();
        assert_eq!(status_of(&jobs, job.id), JobStatus::Todo);
    }

    #[tokio::test]
    async fn dispatch_fails_terminally_once_the_attempt_ceiling_is_reached() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "always_retry_task",
            "default",
            Arc::new(|_ctx: TaskContext| -> TaskFuture {
                Box::pin(async {
                    Err(TaskOutcome::JobRetry {
                        preferred_retry_interval: None,
                    })
                })
            }),
        );
        let (mut worker, store) = test_worker(registry).await;
        worker.max_attempts = 1;
        let job = fetched_job(&store, "always_retry_task").await;
        assert_eq!(job.attempts, 1);

        worker.dispatch(job.clone()).await;

        let jobs = store.list_jobs(Some(job.id), None, None, None, None).await.unwrap();
        assert_eq!(status_of(&jobs, job.id), JobStatus::Failed);
    }

    #[tokio::test]
    async fn dispatch_fails_without_retry_on_job_aborted() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "abort_task",
            "default",
            Arc::new(|_ctx: TaskContext| -> TaskFuture {
                Box::pin(async { Err(TaskOutcome::JobAborted("nope".to_owned())) })
            }),
        );
        let (worker, store) = test_worker(registry).await;
        let job = fetched_job(&store, "abort_task").await;

        worker.dispatch(job.clone()).await;

        let jobs = store.list_jobs(Some(job.id), None, None, None, None).await.unwrap();
        assert_eq!(status_of(&jobs, job.id), JobStatus::Failed);
    }
}
