//! The command-line front-end: `worker` starts the fetch/dispatch loop,
//! `defer` enqueues one job, and the remaining subcommands expose the
//! read-only admin queries. This binary only wires `queue-common` and
//! `queue-worker` together; it implements none of the job lifecycle itself.

mod commands;
mod error;
mod tasks;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use envconfig::Envconfig;
use queue_common::job::NewJob;
use queue_common::{Connector, JobStore, PgConnector, StoreError};
use tracing_subscriber::EnvFilter;

use commands::{Cli, Commands};
use error::CliError;

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn database_url(cli: &Cli) -> Result<String, CliError> {
    if let Some(url) = &cli.database_url {
        return Ok(url.clone());
    }
    std::env::var("QUEUE_DATABASE_URL")
        .map_err(|_| CliError::Config("QUEUE_DATABASE_URL is not set".to_owned()))
}

fn channel_prefix() -> String {
    std::env::var("QUEUE_CHANNEL_PREFIX").unwrap_or_else(|_| "procrastinate".to_owned())
}

/// Parses `key=value` CLI tokens into a single JSON object, the payload
/// handed to the task body by destructuring at the boundary.
fn parse_payload(pairs: &[String]) -> Result<serde_json::Value, CliError> {
    let mut obj = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CliError::InvalidPayload(pair.clone()))?;
        let parsed = serde_json::from_str(value).unwrap_or(serde_json::Value::String(value.to_owned()));
        obj.insert(key.to_owned(), parsed);
    }
    Ok(serde_json::Value::Object(obj))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "queue-cli failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    match &cli.command {
        Commands::Worker { name, queues } => run_worker(&cli, name, queues).await,
        Commands::Defer {
            task_name,
            lock,
            queueing_lock,
            ignore_already_enqueued,
            queue,
            payload,
        } => {
            run_defer(
                &cli,
                task_name,
                lock.clone(),
                queueing_lock.clone(),
                *ignore_already_enqueued,
                queue.clone(),
                payload,
            )
            .await
        }
        Commands::ListJobs {
            id,
            queue,
            task_name,
            status,
            lock,
        } => run_list_jobs(&cli, *id, queue.clone(), task_name.clone(), status.clone(), lock.clone()).await,
        Commands::ListQueues => run_list_queues(&cli).await,
        Commands::ListTasks => run_list_tasks(&cli).await,
        Commands::SetJobStatus { id, status } => run_set_job_status(&cli, *id, status).await,
    }
}

async fn run_worker(cli: &Cli, name: &str, queues: &str) -> Result<ExitCode, CliError> {
    let mut config = queue_worker::Config::init_from_env()
        .map_err(|e| CliError::Config(e.to_string()))?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    config.worker_name = name.to_owned();
    if !queues.is_empty() {
        config.queues = queues.to_owned();
    }
    config
        .validate()
        .map_err(CliError::Config)?;

    let connector = PgConnector::connect_with_channel_prefix(
        &config.database_url,
        config.max_pg_connections,
        config.channel_prefix.as_str(),
    )
    .await?;
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let mut registry = queue_worker::TaskRegistry::new();
    tasks::register_demo_tasks(&mut registry);

    let worker_name = config.worker_name.clone();
    let app = queue_worker::App::new(config, connector, registry);
    app.run(&worker_name).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_defer(
    cli: &Cli,
    task_name: &str,
    lock: Option<String>,
    queueing_lock: Option<String>,
    ignore_already_enqueued: bool,
    queue: Option<String>,
    payload: &[String],
) -> Result<ExitCode, CliError> {
    let prefix = channel_prefix();
    let connector = PgConnector::connect_with_channel_prefix(&database_url(cli)?, 5, &prefix).await?;
    let store = JobStore::new(Arc::new(connector), channel_prefix());

    let args = parse_payload(payload)?;
    let mut job = NewJob::new(task_name, queue.unwrap_or_else(|| "default".to_owned()), args);
    if let Some(lock) = lock {
        job = job.with_lock(lock);
    }
    if let Some(queueing_lock) = queueing_lock {
        job = job.with_queueing_lock(queueing_lock);
    }

    match store.defer_job(job).await {
        Ok(id) => {
            tracing::info!(job_id = id, task_name, "deferred job");
            Ok(ExitCode::SUCCESS)
        }
        Err(StoreError::AlreadyEnqueued { queueing_lock }) => {
            tracing::warn!(?queueing_lock, "job already enqueued");
            if ignore_already_enqueued {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Err(other) => Err(other.into()),
    }
}

async fn run_list_jobs(
    cli: &Cli,
    id: Option<i64>,
    queue: Option<String>,
    task_name: Option<String>,
    status: Option<String>,
    lock: Option<String>,
) -> Result<ExitCode, CliError> {
    let prefix = channel_prefix();
    let connector = PgConnector::connect_with_channel_prefix(&database_url(cli)?, 5, &prefix).await?;
    let store = JobStore::new(Arc::new(connector), channel_prefix());
    let jobs = store
        .list_jobs(id, queue.as_deref(), task_name.as_deref(), status.as_deref(), lock.as_deref())
        .await?;
    for job in jobs {
        println!(
            "{}\t{}\t{}\t{}\tattempts={}",
            job.id, job.queue, job.task_name, job.status, job.attempts
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_list_queues(cli: &Cli) -> Result<ExitCode, CliError> {
    let prefix = channel_prefix();
    let connector = PgConnector::connect_with_channel_prefix(&database_url(cli)?, 5, &prefix).await?;
    let store = JobStore::new(Arc::new(connector), channel_prefix());
    for row in store.list_queues().await? {
        println!("{}\t{}\t{}", row.key, row.status, row.job_count);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_list_tasks(cli: &Cli) -> Result<ExitCode, CliError> {
    let prefix = channel_prefix();
    let connector = PgConnector::connect_with_channel_prefix(&database_url(cli)?, 5, &prefix).await?;
    let store = JobStore::new(Arc::new(connector), channel_prefix());
    for row in store.list_tasks().await? {
        println!("{}\t{}\t{}", row.key, row.status, row.job_count);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_set_job_status(cli: &Cli, id: i64, status: &str) -> Result<ExitCode, CliError> {
    let prefix = channel_prefix();
    let connector = PgConnector::connect_with_channel_prefix(&database_url(cli)?, 5, &prefix).await?;
    let store = JobStore::new(Arc::new(connector), channel_prefix());
    let status: queue_common::job::JobStatus = status
        .parse()
        .map_err(|_: queue_common::ConnectorError| CliError::Config(format!("invalid status {status:?}")))?;
    store.set_job_status(id, status).await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_payload_coerces_json_scalars() {
        let value = parse_payload(&["a=5".to_owned(), "b=\"x\"".to_owned(), "c=true".to_owned()]).unwrap();
        assert_eq!(value, serde_json::json!({"a": 5, "b": "x", "c": true}));
    }

    #[test]
    fn parse_payload_falls_back_to_a_bare_string() {
        let value = parse_payload(&["name=alice".to_owned()]).unwrap();
        assert_eq!(value, serde_json::json!({"name": "alice"}));
    }

    #[test]
    fn parse_payload_rejects_a_token_with_no_equals_sign() {
        assert!(parse_payload(&["nope".to_owned()]).is_err());
    }
}
