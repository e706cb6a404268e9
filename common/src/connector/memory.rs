//! An in-process [`Connector`] used only to validate the job store's contract in
//! tests, mirroring the Python test suite's `InMemoryConnector` fixture. Never
//! wired into a release binary.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::connector::{Connector, Param, QueryName, Row, WakeEvent};
use crate::error::ConnectorError;
use crate::job::JobStatus;

#[derive(Debug, Clone)]
struct MemJob {
    id: i64,
    queue: String,
    task_name: String,
    args: serde_json::Value,
    lock: Option<String>,
    queueing_lock: Option<String>,
    status: JobStatus,
    scheduled_at: Option<DateTime<Utc>>,
    attempts: i32,
    updated_at: DateTime<Utc>,
}

impl MemJob {
    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.set("id", json!(self.id));
        row.set("queue", json!(self.queue));
        row.set("task_name", json!(self.task_name));
        row.set("args", self.args.clone());
        row.set("lock", json!(self.lock));
        row.set("queueing_lock", json!(self.queueing_lock));
        row.set("status", json!(self.status.as_str()));
        row.set(
            "scheduled_at",
            json!(self.scheduled_at.map(|t| t.to_rfc3339())),
        );
        row.set("attempts", json!(self.attempts));
        row.set("updated_at", json!(self.updated_at.to_rfc3339()));
        row
    }
}

#[derive(Default)]
struct MemState {
    jobs: Vec<MemJob>,
    events: Vec<(i64, String, DateTime<Utc>)>,
}

pub struct InMemoryConnector {
    state: Mutex<MemState>,
    next_id: AtomicI64,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn text(p: &Param) -> Option<String> {
    match p {
        Param::Text(s) => Some(s.clone()),
        Param::OptText(o) => o.clone(),
        _ => None,
    }
}

fn bigint(p: &Param) -> Option<i64> {
    match p {
        Param::BigInt(n) => Some(*n),
        Param::OptBigInt(n) => *n,
        _ => None,
    }
}

fn timestamp(p: &Param) -> Option<DateTime<Utc>> {
    match p {
        Param::Timestamp(t) => Some(*t),
        Param::OptTimestamp(t) => *t,
        _ => None,
    }
}

fn text_array(p: &Param) -> Vec<String> {
    match p {
        Param::TextArray(v) => v.clone(),
        _ => Vec::new(),
    }
}

fn boolean(p: &Param) -> bool {
    matches!(p, Param::Bool(true))
}

fn int(p: &Param) -> Option<i64> {
    match p {
        Param::Int(n) => Some(*n as i64),
        _ => None,
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn execute_query(&self, query: QueryName, params: &[Param]) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        match query {
            QueryName::FinishJob => {
                let id = bigint(&params[0]).expect("FinishJob requires id");
                let status_str = text(&params[1]).expect("FinishJob requires status");
                let scheduled_at = timestamp(&params[2]);
                if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id && j.status == JobStatus::Doing) {
                    job.updated_at = Utc::now();
                    if let Some(scheduled_at) = scheduled_at {
                        job.status = JobStatus::Todo;
                        job.scheduled_at = Some(scheduled_at);
                    } else {
                        job.status = status_str.parse().unwrap_or(JobStatus::Failed);
                    }
                }
                // Idempotent: a non-matching job (already terminal) is silently a no-op.
            }
            QueryName::DeleteOldJobs => {
                let hours = int(&params[0]).unwrap_or(0);
                let queue_filter = text(&params[1]);
                let include_failed = boolean(&params[2]);
                let threshold = Utc::now() - Duration::hours(hours);
                state.jobs.retain(|j| {
                    let eligible_status = j.status == JobStatus::Succeeded
                        || (include_failed && j.status == JobStatus::Failed);
                    let old_enough = j.updated_at <= threshold;
                    let matches_queue = queue_filter.as_ref().map_or(true, |q| *q == j.queue);
                    !(eligible_status && old_enough && matches_queue)
                });
            }
            QueryName::InsertJobEvent => {
                let job_id = bigint(&params[0]).expect("InsertJobEvent requires job_id");
                let event_type = text(&params[1]).expect("InsertJobEvent requires event_type");
                state.events.push((job_id, event_type, Utc::now()));
            }
            other => {
                return Err(ConnectorError::QueryError {
                    query: format!("{other:?} is not a void-returning query on InMemoryConnector"),
                    error: sqlx::Error::Protocol("unsupported".into()),
                })
            }
        }
        Ok(())
    }

    async fn execute_query_one(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Row, ConnectorError> {
        self.execute_query_maybe_one(query, params)
            .await?
            .ok_or_else(|| ConnectorError::NoRowReturned {
                query: format!("{query:?}"),
            })
    }

    async fn execute_query_all(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Vec<Row>, ConnectorError> {
        let state = self.state.lock().await;
        match query {
            QueryName::GetStalledJobs => {
                let threshold_secs = int(&params[0]).unwrap_or(0);
                let threshold = Utc::now() - Duration::seconds(threshold_secs);
                Ok(state
                    .jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Doing && j.updated_at <= threshold)
                    .map(MemJob::to_row)
                    .collect())
            }
            QueryName::ListJobs => {
                let id = bigint(&params[0]);
                let queue = text(&params[1]);
                let task_name = text(&params[2]);
                let status = text(&params[3]);
                let lock = text(&params[4]);
                Ok(state
                    .jobs
                    .iter()
                    .filter(|j| id.map_or(true, |v| v == j.id))
                    .filter(|j| queue.as_ref().map_or(true, |v| v == &j.queue))
                    .filter(|j| task_name.as_ref().map_or(true, |v| v == &j.task_name))
                    .filter(|j| status.as_ref().map_or(true, |v| v == j.status.as_str()))
                    .filter(|j| lock.as_ref().map_or(true, |v| Some(v) == j.lock.as_ref()))
                    .map(MemJob::to_row)
                    .collect())
            }
            QueryName::ListQueues => Ok(aggregate(&state.jobs, |j| j.queue.clone(), "queue")),
            QueryName::ListTasks => Ok(aggregate(&state.jobs, |j| j.task_name.clone(), "task_name")),
            other => Err(ConnectorError::QueryError {
                query: format!("{other:?} is not a multi-row query on InMemoryConnector"),
                error: sqlx::Error::Protocol("unsupported".into()),
            }),
        }
    }

    async fn execute_query_maybe_one(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Option<Row>, ConnectorError> {
        let mut state = self.state.lock().await;
        match query {
            QueryName::DeferJob => {
                let queue = text(&params[0]).expect("queue");
                let task_name = text(&params[1]).expect("task_name");
                let args = match &params[2] {
                    Param::Json(v) => v.clone(),
                    _ => serde_json::Value::Null,
                };
                let lock = text(&params[3]);
                let queueing_lock = text(&params[4]);
                let scheduled_at = timestamp(&params[5]);

                if let Some(ref ql) = queueing_lock {
                    let collides = state
                        .jobs
                        .iter()
                        .any(|j| j.status == JobStatus::Todo && j.queueing_lock.as_deref() == Some(ql.as_str()));
                    if collides {
                        return Err(ConnectorError::UniqueViolation {
                            constraint_name: crate::store::QUEUEING_LOCK_CONSTRAINT.to_owned(),
                        });
                    }
                }

                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let job = MemJob {
                    id,
                    queue,
                    task_name,
                    args,
                    lock,
                    queueing_lock,
                    status: JobStatus::Todo,
                    scheduled_at,
                    attempts: 0,
                    updated_at: Utc::now(),
                };
                state.jobs.push(job);
                let mut row = Row::new();
                row.set("id", json!(id));
                Ok(Some(row))
            }
            QueryName::FetchJob => {
                let queues = text_array(&params[0]);
                let doing_locks: std::collections::HashSet<String> = state
                    .jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Doing)
                    .filter_map(|j| j.lock.clone())
                    .collect();
                let now = Utc::now();
                let candidate_id = state
                    .jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Todo)
                    .filter(|j| j.scheduled_at.map_or(true, |s| s <= now))
                    .filter(|j| queues.is_empty() || queues.contains(&j.queue))
                    .filter(|j| j.lock.as_ref().map_or(true, |l| !doing_locks.contains(l)))
                    .min_by_key(|j| j.id)
                    .map(|j| j.id);

                match candidate_id {
                    None => Ok(None),
                    Some(id) => {
                        let job = state.jobs.iter_mut().find(|j| j.id == id).unwrap();
                        job.status = JobStatus::Doing;
                        job.attempts += 1;
                        job.updated_at = Utc::now();
                        Ok(Some(job.to_row()))
                    }
                }
            }
            QueryName::RetryJob => {
                let id = bigint(&params[0]).expect("id");
                let scheduled_at = timestamp(&params[1]);
                match state.jobs.iter_mut().find(|j| j.id == id && j.status == JobStatus::Failed) {
                    Some(job) => {
                        job.status = JobStatus::Todo;
                        job.scheduled_at = scheduled_at;
                        job.updated_at = Utc::now();
                        let mut row = Row::new();
                        row.set("id", json!(id));
                        Ok(Some(row))
                    }
                    None => Ok(None),
                }
            }
            QueryName::SetJobStatus => {
                let id = bigint(&params[0]).expect("id");
                let status_str = text(&params[1]).expect("status");
                match state.jobs.iter_mut().find(|j| j.id == id) {
                    Some(job) => {
                        job.status = status_str.parse().unwrap_or(job.status);
                        job.updated_at = Utc::now();
                        let mut row = Row::new();
                        row.set("id", json!(id));
                        Ok(Some(row))
                    }
                    None => Ok(None),
                }
            }
            other => Err(ConnectorError::QueryError {
                query: format!("{other:?} is not a maybe-one query on InMemoryConnector"),
                error: sqlx::Error::Protocol("unsupported".into()),
            }),
        }
    }

    async fn listen_notify(
        &self,
        _event: WakeEvent,
        _channels: &[String],
    ) -> Result<(), ConnectorError> {
        // The in-memory connector never emits notifications of its own; tests that
        // need wake-up behavior drive the `WakeEvent` directly.
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

fn aggregate<F>(jobs: &[MemJob], key: F, key_column: &str) -> Vec<Row>
where
    F: Fn(&MemJob) -> String,
{
    let mut counts: std::collections::BTreeMap<(String, &'static str), i64> =
        std::collections::BTreeMap::new();
    for job in jobs {
        *counts.entry((key(job), job.status.as_str())).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|((k, status), count)| {
            let mut row = Row::new();
            row.set(key_column, json!(k));
            row.set("status", json!(status));
            row.set("job_count", json!(count));
            row
        })
        .collect()
}
