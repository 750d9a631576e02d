//! taskforge: a distributed task queue core modeled on the Celery protocol
//! and data model — broker- and backend-pluggable, with a worker executor,
//! an outbox/inbox reliability substrate, a cron/interval beat scheduler,
//! and a chain/group/chord/saga composition runtime.
//!
//! This crate implements the execution core only: the contracts in
//! [`broker`] and [`backend`] are meant to be backed by real drivers
//! (AMQP, Redis, Postgres, ...); the in-memory implementations shipped
//! here (`broker::in_memory`, `backend::in_memory`) are reference
//! implementations and the default for tests and single-process use.

pub mod backend;
pub mod beat;
pub mod broker;
pub mod canvas;
pub mod client;
pub mod config;
pub mod delayed;
pub mod error;
pub mod executor;
pub mod filters;
pub mod handler;
pub mod model;
pub mod registry;
pub mod reliability;
pub mod resilience;
pub mod router;
pub mod saga;
pub mod serializer;
pub mod signals;
pub mod stores;
pub mod time_limit;

pub use client::{AsyncResult, Client, SendOptions};
pub use config::Settings;
pub use error::{TaskExecutionException, TaskQueueError, TaskQueueResult};
pub use handler::{FnHandler, HandlerOutcome, TaskContext, TaskHandler};
pub use model::{TaskMessage, TaskResult, TaskState};
pub use registry::{TaskBuilder, TaskDescriptor, TaskRegistry};
