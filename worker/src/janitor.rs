//! Periodic maintenance: warn about stalled jobs, delete old terminal jobs.
//!
//! Grounded on `hook-janitor`'s `cleanup_loop`: a `tokio::time::interval` tick
//! gating a single in-flight run, reporting liveness on every tick.

use std::sync::Arc;
use std::time::Duration;

use queue_common::health::HealthHandle;
use queue_common::JobStore;
use tokio_util::sync::CancellationToken;

pub struct Janitor {
    pub store: Arc<JobStore>,
    pub interval: Duration,
    pub stalled_threshold_seconds: i64,
    pub delete_old_jobs_after_hours: i64,
    pub delete_include_failed: bool,
    pub liveness: HealthHandle,
    pub shutdown: CancellationToken,
}

impl Janitor {
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick fires immediately, skip it

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("janitor loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.liveness.report_healthy().await;
                    self.run_once().await;
                }
            }
        }
    }

    async fn run_once(&self) {
        match self.store.get_stalled_jobs(self.stalled_threshold_seconds).await {
            Ok(stalled) if !stalled.is_empty() => {
                for job in &stalled {
                    tracing::warn!(
                        job_id = job.id,
                        queue = job.queue,
                        task_name = job.task_name,
                        attempts = job.attempts,
                        updated_at = %job.updated_at,
                        "job has been 'doing' past the stalled threshold"
                    );
                }
                metrics::gauge!("queue_stalled_jobs").set(stalled.len() as f64);
            }
            Ok(_) => metrics::gauge!("queue_stalled_jobs").set(0.0),
            Err(err) => tracing::error!(error = %err, "failed to query stalled jobs"),
        }

        if let Err(err) = self
            .store
            .delete_old_jobs(
                self.delete_old_jobs_after_hours,
                None,
                self.delete_include_failed,
            )
            .await
        {
            tracing::error!(error = %err, "failed to delete old jobs");
        }
    }
}
