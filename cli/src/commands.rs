//! Clap `Cli`/`Commands` derive structure, grounded on the pack's
//! `posthog-cli` CLI tooling (`cli/src/commands.rs`'s top-level `Cli` with a
//! `#[command(subcommand)]` enum).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "queue-cli", version, about = "Distributed job queue control plane")]
pub struct Cli {
    /// Stackable verbosity: -v for info, -vv for debug, -vvv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Overrides QUEUE_DATABASE_URL.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start one or more worker loops.
    Worker {
        /// Identifies this process in logs; has no effect on job eligibility.
        #[arg(long, default_value = "worker")]
        name: String,

        /// Comma-separated queues to subscribe to; empty means every
        /// registered queue.
        #[arg(long, default_value = "")]
        queues: String,
    },

    /// Enqueue one job.
    Defer {
        /// Registered task name.
        task_name: String,

        #[arg(long = "lock")]
        lock: Option<String>,

        #[arg(long = "queueing-lock")]
        queueing_lock: Option<String>,

        /// Treat `AlreadyEnqueued` as success (exit 0 instead of 1).
        #[arg(long)]
        ignore_already_enqueued: bool,

        /// Queue to enqueue onto; defaults to the task's registered queue.
        #[arg(long)]
        queue: Option<String>,

        /// `key=value` payload fields, e.g. `a=5 b=7`.
        #[arg(trailing_var_arg = true)]
        payload: Vec<String>,
    },

    /// List jobs matching the given filters.
    ListJobs {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        task_name: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        lock: Option<String>,
    },

    /// List queues with per-status job counts.
    ListQueues,

    /// List task names with per-status job counts.
    ListTasks,

    /// Force a job's status, bypassing the normal state machine. For manual
    /// recovery of stalled jobs.
    SetJobStatus { id: i64, status: String },
}
