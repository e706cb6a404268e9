//! The production [`Connector`], backed by a `sqlx::PgPool`.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{PgPool, Row as SqlxRow};

use crate::connector::{Connector, Param, QueryName, Row, WakeEvent};
use crate::error::ConnectorError;
use crate::job::JobStatus;

/// Wraps a connection pool and turns logical [`QueryName`]s into parameterized SQL.
///
/// Mirrors `PgQueue::new`'s pool-construction idiom: a single pool shared by every
/// fetch/dispatch loop in the worker process, sized by the caller (at least as large
/// as the worker's concurrency, or fetches will starve waiting on a free connection).
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    /// Connects with the default `procrastinate` notification channel prefix.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ConnectorError> {
        Self::connect_with_channel_prefix(database_url, max_connections, "procrastinate").await
    }

    /// Connects and sets `queue.channel_prefix` as a per-session startup option, so the
    /// `notify_queue()` trigger emits on the same channel names this process listens on.
    pub async fn connect_with_channel_prefix(
        database_url: &str,
        max_connections: u32,
        channel_prefix: &str,
    ) -> Result<Self, ConnectorError> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|error| ConnectorError::ConnectionError { error })?
            .options([("queue.channel_prefix", channel_prefix)]);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|error| ConnectorError::ConnectionError { error })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_row_to_row(row: &sqlx::postgres::PgRow) -> Result<Row, ConnectorError> {
    let mut out = Row::new();
    let id: i64 = row.try_get("id").map_err(decode_err("id"))?;
    let queue: String = row.try_get("queue").map_err(decode_err("queue"))?;
    let task_name: String = row.try_get("task_name").map_err(decode_err("task_name"))?;
    let args: serde_json::Value = row.try_get("args").map_err(decode_err("args"))?;
    let lock: Option<String> = row.try_get("lock").map_err(decode_err("lock"))?;
    let queueing_lock: Option<String> = row
        .try_get("queueing_lock")
        .map_err(decode_err("queueing_lock"))?;
    let status: JobStatus = row.try_get("status").map_err(decode_err("status"))?;
    let scheduled_at: Option<chrono::DateTime<chrono::Utc>> = row
        .try_get("scheduled_at")
        .map_err(decode_err("scheduled_at"))?;
    let attempts: i32 = row.try_get("attempts").map_err(decode_err("attempts"))?;
    let updated_at: chrono::DateTime<chrono::Utc> =
        row.try_get("updated_at").map_err(decode_err("updated_at"))?;

    out.set("id", json!(id));
    out.set("queue", json!(queue));
    out.set("task_name", json!(task_name));
    out.set("args", args);
    out.set("lock", json!(lock));
    out.set("queueing_lock", json!(queueing_lock));
    out.set("status", json!(status.as_str()));
    out.set(
        "scheduled_at",
        json!(scheduled_at.map(|t| t.to_rfc3339())),
    );
    out.set("attempts", json!(attempts));
    out.set("updated_at", json!(updated_at.to_rfc3339()));
    Ok(out)
}

fn decode_err(column: &'static str) -> impl Fn(sqlx::Error) -> ConnectorError {
    move |error| ConnectorError::QueryError {
        query: format!("decode column {column}"),
        error,
    }
}

/// Bind a [`Param`] slice onto a `sqlx::query::Query` in order.
macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                Param::Text(s) => q.bind(s),
                Param::OptText(o) => q.bind(o),
                Param::BigInt(n) => q.bind(n),
                Param::OptBigInt(n) => q.bind(n),
                Param::Int(n) => q.bind(n),
                Param::Json(v) => q.bind(v),
                Param::Timestamp(t) => q.bind(t),
                Param::OptTimestamp(t) => q.bind(t),
                Param::Bool(b) => q.bind(b),
                Param::TextArray(v) => q.bind(v),
            };
        }
        q
    }};
}

/// Maps `sqlx::Error::Database` unique-violations to [`ConnectorError::UniqueViolation`];
/// everything else becomes a plain [`ConnectorError::QueryError`].
fn map_sql_error(query: &str, error: sqlx::Error) -> ConnectorError {
    if let sqlx::Error::Database(ref db_err) = error {
        if db_err.is_unique_violation() {
            let constraint_name = db_err.constraint().unwrap_or("unknown").to_owned();
            return ConnectorError::UniqueViolation { constraint_name };
        }
    }
    ConnectorError::QueryError {
        query: query.to_owned(),
        error,
    }
}

fn sql_for(query: QueryName) -> &'static str {
    match query {
        QueryName::DeferJob => {
            r#"
INSERT INTO jobs (queue, task_name, args, lock, queueing_lock, status, scheduled_at, attempts, updated_at)
VALUES ($1, $2, $3, $4, $5, 'todo', $6, 0, NOW())
RETURNING id
            "#
        }
        QueryName::FetchJob => {
            r#"
WITH eligible AS (
    SELECT j.id
    FROM jobs j
    WHERE j.status = 'todo'
      AND (j.scheduled_at IS NULL OR j.scheduled_at <= NOW())
      AND (cardinality($1::text[]) = 0 OR j.queue = ANY($1))
      AND (
          j.lock IS NULL
          OR NOT EXISTS (
              SELECT 1 FROM jobs d WHERE d.status = 'doing' AND d.lock = j.lock
          )
      )
    ORDER BY j.id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE jobs
SET status = 'doing', attempts = jobs.attempts + 1, updated_at = NOW()
FROM eligible
WHERE jobs.id = eligible.id
RETURNING jobs.id, jobs.queue, jobs.task_name, jobs.args, jobs.lock, jobs.queueing_lock,
          jobs.status, jobs.scheduled_at, jobs.attempts, jobs.updated_at
            "#
        }
        QueryName::FinishJob => {
            r#"
UPDATE jobs
SET status = CASE WHEN $3::timestamptz IS NULL THEN $2::job_status ELSE 'todo'::job_status END,
    scheduled_at = $3,
    updated_at = NOW()
WHERE id = $1 AND status = 'doing'
            "#
        }
        QueryName::RetryJob => {
            r#"
UPDATE jobs
SET status = 'todo', scheduled_at = $2, updated_at = NOW()
WHERE id = $1 AND status = 'failed'
RETURNING id
            "#
        }
        QueryName::GetStalledJobs => {
            r#"
SELECT id, queue, task_name, args, lock, queueing_lock, status, scheduled_at, attempts, updated_at
FROM jobs
WHERE status = 'doing' AND updated_at <= NOW() - make_interval(secs => $1::double precision)
ORDER BY id
            "#
        }
        QueryName::DeleteOldJobs => {
            r#"
DELETE FROM jobs
WHERE updated_at <= NOW() - make_interval(hours => $1::double precision)
  AND status = ANY(CASE WHEN $3 THEN ARRAY['succeeded', 'failed']::job_status[] ELSE ARRAY['succeeded']::job_status[] END)
  AND ($2::text IS NULL OR queue = $2)
            "#
        }
        QueryName::ListJobs => {
            r#"
SELECT id, queue, task_name, args, lock, queueing_lock, status, scheduled_at, attempts, updated_at
FROM jobs
WHERE ($1::bigint IS NULL OR id = $1)
  AND ($2::text IS NULL OR queue = $2)
  AND ($3::text IS NULL OR task_name = $3)
  AND ($4::text IS NULL OR status = $4::job_status)
  AND ($5::text IS NULL OR lock = $5)
ORDER BY id
            "#
        }
        QueryName::ListQueues => {
            r#"
SELECT queue, status::text AS status, COUNT(*) AS job_count
FROM jobs
GROUP BY queue, status
ORDER BY queue, status
            "#
        }
        QueryName::ListTasks => {
            r#"
SELECT task_name, status::text AS status, COUNT(*) AS job_count
FROM jobs
GROUP BY task_name, status
ORDER BY task_name, status
            "#
        }
        QueryName::SetJobStatus => {
            r#"
UPDATE jobs SET status = $2::job_status, updated_at = NOW()
WHERE id = $1
RETURNING id
            "#
        }
        QueryName::InsertJobEvent => {
            r#"INSERT INTO job_events (job_id, event_type, at) VALUES ($1, $2, NOW())"#
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn execute_query(&self, query: QueryName, params: &[Param]) -> Result<(), ConnectorError> {
        let sql = sql_for(query);
        let q = bind_params!(sqlx::query(sql), params);
        q.execute(&self.pool)
            .await
            .map_err(|e| map_sql_error(sql, e))?;
        Ok(())
    }

    async fn execute_query_one(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Row, ConnectorError> {
        let sql = sql_for(query);
        let q = bind_params!(sqlx::query(sql), params);
        let row = q
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => ConnectorError::NoRowReturned {
                    query: sql.to_owned(),
                },
                other => map_sql_error(sql, other),
            })?;

        match query {
            QueryName::DeferJob | QueryName::RetryJob | QueryName::SetJobStatus => {
                let id: i64 = row.try_get("id").map_err(decode_err("id"))?;
                let mut out = Row::new();
                out.set("id", json!(id));
                Ok(out)
            }
            QueryName::FetchJob => job_row_to_row(&row),
            _ => job_row_to_row(&row),
        }
    }

    async fn execute_query_all(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Vec<Row>, ConnectorError> {
        let sql = sql_for(query);
        let q = bind_params!(sqlx::query(sql), params);
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sql_error(sql, e))?;

        rows.iter()
            .map(|row| match query {
                QueryName::ListQueues => {
                    let queue: String = row.try_get("queue").map_err(decode_err("queue"))?;
                    let status: String = row.try_get("status").map_err(decode_err("status"))?;
                    let count: i64 = row.try_get("job_count").map_err(decode_err("job_count"))?;
                    let mut out = Row::new();
                    out.set("queue", json!(queue));
                    out.set("status", json!(status));
                    out.set("job_count", json!(count));
                    Ok(out)
                }
                QueryName::ListTasks => {
                    let task_name: String =
                        row.try_get("task_name").map_err(decode_err("task_name"))?;
                    let status: String = row.try_get("status").map_err(decode_err("status"))?;
                    let count: i64 = row.try_get("job_count").map_err(decode_err("job_count"))?;
                    let mut out = Row::new();
                    out.set("task_name", json!(task_name));
                    out.set("status", json!(status));
                    out.set("job_count", json!(count));
                    Ok(out)
                }
                _ => job_row_to_row(row),
            })
            .collect()
    }

    async fn execute_query_maybe_one(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Option<Row>, ConnectorError> {
        let sql = sql_for(query);
        let q = bind_params!(sqlx::query(sql), params);
        let row = q
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sql_error(sql, e))?;

        match row {
            None => Ok(None),
            Some(row) => match query {
                QueryName::RetryJob | QueryName::SetJobStatus => {
                    let id: i64 = row.try_get("id").map_err(decode_err("id"))?;
                    let mut out = Row::new();
                    out.set("id", json!(id));
                    Ok(Some(out))
                }
                _ => job_row_to_row(&row).map(Some),
            },
        }
    }

    async fn listen_notify(
        &self,
        event: WakeEvent,
        channels: &[String],
    ) -> Result<(), ConnectorError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|error| ConnectorError::ConnectionError { error })?;

        let channel_refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        listener
            .listen_all(channel_refs)
            .await
            .map_err(|error| ConnectorError::ConnectionError { error })?;

        loop {
            match listener.recv().await {
                Ok(_notification) => event.notify_one(),
                Err(error) => return Err(ConnectorError::ConnectionError { error }),
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod pg_tests {
    use std::sync::Arc;

    use sqlx::PgPool;

    use super::PgConnector;
    use crate::error::StoreError;
    use crate::job::{FinishOutcome, JobStatus, NewJob};
    use crate::store::JobStore;

    #[sqlx::test(migrations = "../migrations")]
    async fn defer_then_fetch_job_round_trips_through_postgres(db: PgPool) {
        let store = JobStore::new(Arc::new(PgConnector::from_pool(db)), "procrastinate");

        let id = store
            .defer_job(NewJob::new(
                "send_email",
                "emails",
                serde_json::json!({"to": "a@b.com"}),
            ))
            .await
            .expect("defer_job failed");

        let job = store
            .fetch_job(&[])
            .await
            .expect("fetch_job failed")
            .expect("expected a fetched job");

        assert_eq!(job.id, id);
        assert_eq!(job.task_name, "send_email");
        assert_eq!(job.status, JobStatus::Doing);
        assert_eq!(job.attempts, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn finish_job_marks_it_succeeded(db: PgPool) {
        let store = JobStore::new(Arc::new(PgConnector::from_pool(db)), "procrastinate");
        store
            .defer_job(NewJob::new("noop", "default", serde_json::json!({})))
            .await
            .unwrap();
        let job = store.fetch_job(&[]).await.unwrap().unwrap();

        store
            .finish_job(job.id, FinishOutcome::Succeeded)
            .await
            .unwrap();

        let jobs = store
            .list_jobs(Some(job.id), None, None, None, None)
            .await
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Succeeded);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn a_queueing_lock_collision_is_reported_as_already_enqueued(db: PgPool) {
        let store = JobStore::new(Arc::new(PgConnector::from_pool(db)), "procrastinate");
        let job =
            NewJob::new("send_email", "emails", serde_json::json!({})).with_queueing_lock("user-42");

        store
            .defer_job(job.clone())
            .await
            .expect("first defer should succeed");
        let err = store
            .defer_job(job)
            .await
            .expect_err("second defer should collide on the queueing lock");

        assert!(matches!(err, StoreError::AlreadyEnqueued { .. }));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn fetch_job_respects_lock_mutual_exclusion(db: PgPool) {
        let store = JobStore::new(Arc::new(PgConnector::from_pool(db)), "procrastinate");
        store
            .defer_job(NewJob::new("a", "default", serde_json::json!({})).with_lock("resource-1"))
            .await
            .unwrap();
        store
            .defer_job(NewJob::new("b", "default", serde_json::json!({})).with_lock("resource-1"))
            .await
            .unwrap();

        let first = store
            .fetch_job(&[])
            .await
            .unwrap()
            .expect("first job should be eligible");
        let second = store.fetch_job(&[]).await.unwrap();
        assert!(second.is_none(), "second job shares a held lock and must wait");

        store
            .finish_job(first.id, FinishOutcome::Succeeded)
            .await
            .unwrap();
        let second = store
            .fetch_job(&[])
            .await
            .unwrap()
            .expect("lock released, second job is now eligible");
        assert_eq!(second.task_name, "b");
    }
}
