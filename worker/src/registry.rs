//! In-process mapping from task name to executable callable.
//!
//! Populated at startup by [`TaskRegistry::register`] and never mutated after
//! workers start, the same "decorator becomes an explicit table" idiom
//! `procrastinate.tasks.TaskManager` uses under the hood.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use queue_common::error::TaskOutcome;

/// Everything a task body needs out of the job that triggered it, without
/// exposing the full persisted [`queue_common::Job`] (and its connector-facing
/// fields) to task authors.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: i64,
    pub attempts: i32,
    pub args: serde_json::Value,
}

pub type TaskFuture = BoxFuture<'static, Result<(), TaskOutcome>>;
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTask {
    pub queue: String,
    pub func: TaskFn,
}

#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` on `queue`. Registering an already-known name replaces the
    /// prior entry — last writer wins, since registration only ever happens at
    /// startup, sequentially.
    pub fn register(&mut self, name: impl Into<String>, queue: impl Into<String>, func: TaskFn) {
        self.tasks.insert(
            name.into(),
            RegisteredTask {
                queue: queue.into(),
                func,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    /// The set of every queue reachable through a registered task. Used when a
    /// worker is started with no explicit `--queues`, in which case it must
    /// subscribe to all of them.
    pub fn all_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .tasks
            .values()
            .map(|t| t.queue.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        queues.sort();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: TaskContext) -> TaskFuture {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn lookup_returns_the_registered_queue() {
        let mut registry = TaskRegistry::new();
        registry.register("sum_task", "default", Arc::new(noop));

        let task = registry.lookup("sum_task").expect("registered");
        assert_eq!(task.queue, "default");
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn re_registering_a_name_replaces_the_prior_entry() {
        let mut registry = TaskRegistry::new();
        registry.register("t", "a", Arc::new(noop));
        registry.register("t", "b", Arc::new(noop));

        assert_eq!(registry.lookup("t").unwrap().queue, "b");
    }

    #[test]
    fn all_queues_is_the_deduplicated_sorted_union() {
        let mut registry = TaskRegistry::new();
        registry.register("t1", "emails", Arc::new(noop));
        registry.register("t2", "default", Arc::new(noop));
        registry.register("t3", "emails", Arc::new(noop));

        assert_eq!(registry.all_queues(), vec!["default".to_owned(), "emails".to_owned()]);
    }
}
