//! The database abstraction the job store is built on.
//!
//! A [`Connector`] carries parameterized SQL statements and LISTEN/NOTIFY
//! subscriptions between the engine and whatever actually stores the rows.
//! [`PgConnector`] is the only implementation that runs in production;
//! [`InMemoryConnector`] (test-only) exists solely to validate that the
//! [`crate::store::JobStore`] logic above this trait is correct independent of SQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ConnectorError;

/// A single bound parameter. Kept deliberately small: the store only ever needs to
/// bind scalars and JSON blobs, never arbitrary SQL types.
#[derive(Debug, Clone)]
pub enum Param {
    Text(String),
    OptText(Option<String>),
    BigInt(i64),
    OptBigInt(Option<i64>),
    Int(i32),
    Json(Value),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
    Bool(bool),
    TextArray(Vec<String>),
}

/// A result row, addressed by column name. Backend-agnostic so the same [`crate::store::JobStore`]
/// code reads rows produced by either [`PgConnector`] or [`InMemoryConnector`].
#[derive(Debug, Clone, Default)]
pub struct Row(std::collections::HashMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self(std::collections::HashMap::new())
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_i32(&self, column: &str) -> Option<i32> {
        self.get(column).and_then(Value::as_i64).map(|v| v as i32)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn get_timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        self.get_str(column)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// A named, logical SQL operation. The Connector trait is parameterized on the
/// query's identity rather than a raw string so a non-SQL [`InMemoryConnector`] can
/// switch on it instead of parsing SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryName {
    DeferJob,
    FetchJob,
    FinishJob,
    RetryJob,
    GetStalledJobs,
    DeleteOldJobs,
    ListJobs,
    ListQueues,
    ListTasks,
    SetJobStatus,
    InsertJobEvent,
}

/// Edge-triggered wake-up signal the Connector's listen loop fires on every
/// notification it receives. Mirrors `tokio::sync::Notify`'s semantics exactly;
/// this alias exists so call sites read in terms of the domain concept.
pub type WakeEvent = Arc<tokio::sync::Notify>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Execute a statement with no expected rows.
    async fn execute_query(&self, query: QueryName, params: &[Param]) -> Result<(), ConnectorError>;

    /// Execute a statement and return exactly one row; errors if zero rows come back.
    async fn execute_query_one(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Row, ConnectorError>;

    /// Execute a statement and return zero, one, or many rows.
    async fn execute_query_all(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Vec<Row>, ConnectorError>;

    /// Execute a statement that may return zero or one row.
    async fn execute_query_maybe_one(
        &self,
        query: QueryName,
        params: &[Param],
    ) -> Result<Option<Row>, ConnectorError>;

    /// Subscribe to every channel in `channels`, signalling `event` on every
    /// notification received, until the connector is closed or the task is
    /// cancelled at its next suspension point. Never returns on its own.
    async fn listen_notify(
        &self,
        event: WakeEvent,
        channels: &[String],
    ) -> Result<(), ConnectorError>;

    /// Release all resources held by this connector.
    async fn close(&self) -> Result<(), ConnectorError>;
}

pub mod memory;
pub mod pg;

pub use memory::InMemoryConnector;
pub use pg::PgConnector;
