//! Demo task registrations driving the CLI's own integration tests and the
//! README quickstart. Never referenced by `queue-common`/`queue-worker`
//! themselves — a real deployment registers its own tasks the same way.

use queue_worker::{TaskContext, TaskFuture, TaskRegistry};

use queue_common::error::TaskOutcome;

fn arg_i64(ctx: &TaskContext, key: &str) -> Option<i64> {
    ctx.args.get(key).and_then(|v| v.as_i64())
}

fn sum_task(ctx: TaskContext) -> TaskFuture {
    Box::pin(async move {
        let a = arg_i64(&ctx, "a").unwrap_or(0);
        let b = arg_i64(&ctx, "b").unwrap_or(0);
        println!("{}", a + b);
        Ok(())
    })
}

fn increment_task(ctx: TaskContext) -> TaskFuture {
    Box::pin(async move {
        let a = arg_i64(&ctx, "a").unwrap_or(0);
        println!("{}", a + 1);
        Ok(())
    })
}

fn product_task(ctx: TaskContext) -> TaskFuture {
    Box::pin(async move {
        let a = arg_i64(&ctx, "a").unwrap_or(0);
        let b = arg_i64(&ctx, "b").unwrap_or(0);
        println!("{}", a * b);
        Ok(())
    })
}

/// Sleeps, writes `write_before`, sleeps again, writes `write_after`. Used by
/// the lock-serialization scenario: many instances share a lock, so the
/// before/after pairs across all of them must never interleave.
fn sleep_and_write(ctx: TaskContext) -> TaskFuture {
    Box::pin(async move {
        let sleep_secs = ctx
            .args
            .get("sleep")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let before = ctx
            .args
            .get("write_before")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let after = ctx
            .args
            .get("write_after")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        println!("{before}");
        tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_secs)).await;
        println!("{after}");
        Ok(())
    })
}

/// Always raises and asks for a retry; the worker's own `RetryPolicy` and
/// `QUEUE_RETRY_MAX_ATTEMPTS` ceiling decide backoff and when to stop
/// retrying and fail the job terminally instead, so the task itself never
/// counts its own attempts.
fn multiple_exception_failures(ctx: TaskContext) -> TaskFuture {
    Box::pin(async move {
        tracing::error!(
            job_id = ctx.job_id,
            attempt = ctx.attempts,
            "multiple_exception_failures raised an exception"
        );
        Err(TaskOutcome::JobRetry {
            preferred_retry_interval: None,
        })
    })
}

pub fn register_demo_tasks(registry: &mut TaskRegistry) {
    registry.register("sum_task", "default", std::sync::Arc::new(sum_task));
    registry.register(
        "increment_task",
        "default",
        std::sync::Arc::new(increment_task),
    );
    registry.register(
        "product_task",
        "product_queue",
        std::sync::Arc::new(product_task),
    );
    registry.register(
        "sleep_and_write",
        "default",
        std::sync::Arc::new(sleep_and_write),
    );
    registry.register(
        "multiple_exception_failures",
        "default",
        std::sync::Arc::new(multiple_exception_failures),
    );
}
