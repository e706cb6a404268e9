//! The worker half of the engine: the Task Registry, the fetch/dispatch/finish
//! loop, the janitor, and the `App` composition root that wires them together
//! with the health/metrics HTTP surface. The CLI front-end (`queue-cli`) is the
//! only thing that constructs an [`app::App`] and drives it to completion.

pub mod app;
pub mod config;
pub mod error;
pub mod janitor;
pub mod registry;
pub mod worker;

pub use app::App;
pub use config::Config;
pub use error::MainError;
pub use registry::{TaskContext, TaskFn, TaskFuture, TaskRegistry};
pub use worker::Worker;
