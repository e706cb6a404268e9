use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "QUEUE_BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "QUEUE_BIND_PORT", default = "3341")]
    pub port: u16,

    #[envconfig(from = "QUEUE_DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "QUEUE_WORKER_NAME", default = "worker")]
    pub worker_name: String,

    #[envconfig(from = "QUEUE_QUEUES", default = "")]
    pub queues: String,

    #[envconfig(from = "QUEUE_CHANNEL_PREFIX", default = "procrastinate")]
    pub channel_prefix: NonEmptyString,

    #[envconfig(from = "QUEUE_CONCURRENCY", default = "4")]
    pub concurrency: usize,

    #[envconfig(from = "QUEUE_POLL_INTERVAL_MS", default = "2000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "QUEUE_MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(from = "QUEUE_STALLED_THRESHOLD_SECONDS", default = "1800")]
    pub stalled_threshold_seconds: i64,

    #[envconfig(from = "QUEUE_CLEANUP_INTERVAL_SECONDS", default = "300")]
    pub cleanup_interval_seconds: u64,

    #[envconfig(from = "QUEUE_DELETE_OLD_JOBS_AFTER_HOURS", default = "24")]
    pub delete_old_jobs_after_hours: i64,

    #[envconfig(from = "QUEUE_DELETE_INCLUDE_FAILED", default = "false")]
    pub delete_include_failed: bool,

    #[envconfig(from = "QUEUE_SHUTDOWN_GRACE_SECONDS", default = "30")]
    pub shutdown_grace_seconds: u64,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The `--queues` flag / `QUEUE_QUEUES` env var is a comma-separated list;
    /// empty means "every registered queue".
    pub fn queue_list(&self) -> Vec<String> {
        self.queues
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// The connection pool must be sized at least as large as the worker's
    /// concurrency, or fetch loops will starve waiting on a free connection.
    pub fn validate(&self) -> Result<(), String> {
        if (self.max_pg_connections as usize) < self.concurrency {
            return Err(format!(
                "max_pg_connections ({}) must be >= concurrency ({})",
                self.max_pg_connections, self.concurrency
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "QUEUE_RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "QUEUE_RETRY_INITIAL_INTERVAL_MS", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "QUEUE_RETRY_MAXIMUM_INTERVAL_MS", default = "60000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "QUEUE_RETRY_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            host: "0.0.0.0".to_owned(),
            port: 3341,
            database_url: "postgres://localhost/test".to_owned(),
            worker_name: "worker".to_owned(),
            queues: String::new(),
            channel_prefix: NonEmptyString("procrastinate".to_owned()),
            concurrency: 4,
            poll_interval: EnvMsDuration(time::Duration::from_millis(2000)),
            max_pg_connections: 10,
            stalled_threshold_seconds: 1800,
            cleanup_interval_seconds: 300,
            delete_old_jobs_after_hours: 24,
            delete_include_failed: false,
            shutdown_grace_seconds: 30,
            retry_policy: RetryPolicyConfig {
                backoff_coefficient: 2,
                initial_interval: EnvMsDuration(time::Duration::from_millis(1000)),
                maximum_interval: EnvMsDuration(time::Duration::from_millis(60000)),
                max_attempts: 3,
            },
        }
    }

    #[test]
    fn queue_list_splits_and_trims_comma_separated_queues() {
        let mut config = base_config();
        config.queues = " default, emails ,".to_owned();
        assert_eq!(config.queue_list(), vec!["default".to_owned(), "emails".to_owned()]);
    }

    #[test]
    fn queue_list_is_empty_when_unconfigured() {
        assert!(base_config().queue_list().is_empty());
    }

    #[test]
    fn validate_rejects_a_pool_smaller_than_concurrency() {
        let mut config = base_config();
        config.max_pg_connections = 2;
        config.concurrency = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_pool_at_least_as_large_as_concurrency() {
        let mut config = base_config();
        config.max_pg_connections = 4;
        config.concurrency = 4;
        assert!(config.validate().is_ok());
    }
}
