//! poolkeeper-core
//!
//! Core building blocks for the poolkeeper maintenance daemon.
//!
//! # Modules
//! - **domain**: task model (ids, actions, status, records, filters)
//! - **store**: `TaskStore` port + in-memory / SQLite implementations
//! - **queue**: `TaskQueue`, the only owner of the task lifecycle
//! - **worker**: poll/execute loop, handler registry, control channel
//! - **signal**: restart/reload delivery (flag file, service command, channel)
//! - **command**: administrative command family and its dispatcher
//! - **config**: TOML configuration
//! - **observability**: queue counts for status views

pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod queue;
pub mod signal;
pub mod store;
pub mod worker;

pub use command::{CommandDispatcher, CommandRegistry, CommandRunner, RestartPolicy};
pub use domain::{NewTask, Task, TaskAction, TaskFilter, TaskId, TaskStatus};
pub use error::{CommandError, StoreError};
pub use queue::TaskQueue;
pub use store::TaskStore;
pub use worker::{ControlMessage, Worker, WorkerHandle};
