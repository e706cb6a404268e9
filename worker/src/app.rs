//! Composition root: owns the Connector, the Store, and the Registry, and
//! spawns the listen loop, the worker pool, the janitor, and the
//! health/metrics HTTP surface. Grounded on `hook-worker/src/main.rs`'s
//! wiring, generalized from one webhook worker into `concurrency` independent
//! fetch/dispatch loops plus a two-stage soft/hard shutdown escalation.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::routing::get;
use axum::Router;
use queue_common::connector::Connector;
use queue_common::health::HealthRegistry;
use queue_common::retry::RetryPolicy;
use queue_common::{metrics::serve, metrics::setup_metrics_routes, JobStore};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::MainError;
use crate::janitor::Janitor;
use crate::registry::TaskRegistry;
use crate::worker::Worker;

pub struct App {
    config: Config,
    connector: Arc<dyn Connector>,
    store: Arc<JobStore>,
    registry: Arc<TaskRegistry>,
}

impl App {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        registry: TaskRegistry,
    ) -> Self {
        let store = Arc::new(JobStore::new(connector.clone(), config.channel_prefix.as_str()));
        Self {
            config,
            connector,
            store,
            registry: Arc::new(registry),
        }
    }

    /// The queues this process subscribes to: the configured list, or every
    /// queue reachable through the registry if none was given.
    fn queues(&self) -> Vec<String> {
        let configured = self.config.queue_list();
        if configured.is_empty() {
            self.registry.all_queues()
        } else {
            configured
        }
    }

    /// Run until a shutdown signal is observed, then drain in-flight work.
    pub async fn run(self, worker_name: &str) -> Result<(), MainError> {
        let queues = self.queues();
        info!(worker_name, queues = ?queues, concurrency = self.config.concurrency, "starting worker");

        let liveness = HealthRegistry::new("liveness");
        let wake = Arc::new(tokio::sync::Notify::new());
        let soft_shutdown = CancellationToken::new();
        let hard_shutdown = CancellationToken::new();

        let router = Router::new()
            .route("/", get(|| ready("queue-worker")))
            .route("/_readiness", get(|| ready("ok")))
            .route(
                "/_liveness",
                get({
                    let liveness = liveness.clone();
                    move || ready(liveness.get_status())
                }),
            );
        let router = setup_metrics_routes(router);
        let bind = self.config.bind();
        let http_shutdown = soft_shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_until(router, &bind, http_shutdown).await {
                tracing::error!(error = %err, "health/metrics server stopped unexpectedly");
            }
        });

        let listen_handle = {
            let store = self.store.clone();
            let wake = wake.clone();
            let queues = queues.clone();
            let shutdown = soft_shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    res = store.listen(wake, &queues) => {
                        if let Err(err) = res {
                            tracing::error!(error = %err, "listen loop ended");
                        }
                    }
                }
            })
        };

        let worker_liveness = liveness
            .register("workers".to_owned(), time::Duration::seconds(60))
            .await;

        let retry_policy = RetryPolicy::new(
            self.config.retry_policy.backoff_coefficient,
            self.config.retry_policy.initial_interval.0,
            Some(self.config.retry_policy.maximum_interval.0),
        );

        let mut worker_handles = Vec::with_capacity(self.config.concurrency);
        for id in 0..self.config.concurrency {
            let worker = Worker {
                id,
                store: self.store.clone(),
                registry: self.registry.clone(),
                queues: queues.clone(),
                poll_interval: self.config.poll_interval.0,
                wake: wake.clone(),
                liveness: worker_liveness.clone(),
                retry_policy,
                max_attempts: self.config.retry_policy.max_attempts,
                soft_shutdown: soft_shutdown.clone(),
                hard_shutdown: hard_shutdown.clone(),
            };
            worker_handles.push(tokio::spawn(worker.run()));
        }

        let janitor_liveness = liveness
            .register("janitor".to_owned(), time::Duration::seconds(60))
            .await;
        let janitor_handle = {
            let janitor = Janitor {
                store: self.store.clone(),
                interval: StdDuration::from_secs(self.config.cleanup_interval_seconds),
                stalled_threshold_seconds: self.config.stalled_threshold_seconds,
                delete_old_jobs_after_hours: self.config.delete_old_jobs_after_hours,
                delete_include_failed: self.config.delete_include_failed,
                liveness: janitor_liveness,
                shutdown: soft_shutdown.clone(),
            };
            tokio::spawn(janitor.run())
        };

        let grace = StdDuration::from_secs(self.config.shutdown_grace_seconds);
        wait_for_shutdown(&soft_shutdown, &hard_shutdown, grace).await;

        info!("soft shutdown observed, waiting for in-flight jobs to finish");
        listen_handle.abort();
        for handle in worker_handles {
            drop(handle.await);
        }
        drop(janitor_handle.await);

        info!("all worker loops drained, closing connector");
        self.connector.close().await?;
        Ok(())
    }
}

async fn serve_until(
    router: Router,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    tokio::select! {
        res = serve(router, bind) => res,
        _ = shutdown.cancelled() => Ok(()),
    }
}

/// First SIGINT/SIGTERM triggers soft shutdown (stop fetching, let the current
/// job finish). Only a second occurrence of either signal triggers hard
/// shutdown (cancel in-flight work at its next suspension point) — tasks are
/// trusted to run as long as they need, so the grace period only logs a
/// warning once it elapses, it never cancels anything on its own.
async fn wait_for_shutdown(
    soft: &CancellationToken,
    hard: &CancellationToken,
    grace: StdDuration,
) {
    let mut sig_int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sig_term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sig_int.recv() => info!("received SIGINT, starting graceful shutdown"),
        _ = sig_term.recv() => info!("received SIGTERM, starting graceful shutdown"),
    }
    soft.cancel();

    let mut grace_elapsed = false;
    loop {
        tokio::select! {
            _ = sig_int.recv() => {
                info!("received second signal, cancelling in-flight jobs");
                break;
            }
            _ = sig_term.recv() => {
                info!("received second signal, cancelling in-flight jobs");
                break;
            }
            _ = tokio::time::sleep(grace), if !grace_elapsed => {
                grace_elapsed = true;
                tracing::warn!(
                    grace_seconds = grace.as_secs(),
                    "shutdown grace period elapsed, still waiting for a second signal before cancelling in-flight jobs"
                );
            }
        }
    }
    hard.cancel();
}
