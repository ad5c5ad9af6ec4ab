//! Administrative commands.
//!
//! Each command is a [`CommandRunner`]: one bounded mutation through the
//! [`TaskQueue`], reported as a single status line. Runners are looked up by
//! name in a [`CommandRegistry`]; the [`CommandDispatcher`] runs them and
//! decides whether to ask the worker to restart.

mod dispatch;
mod runners;

pub use dispatch::{CommandDispatcher, DispatchOutcome, RestartOutcome, RestartPolicy};
pub use runners::{CancelAction, ScheduleAction, ViewQueue};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::TaskAction;
use crate::error::CommandError;
use crate::queue::TaskQueue;

/// Arguments a command may take. Most take none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArgs {
    /// Directory or share a scheduled task applies to.
    pub path: Option<String>,
}

impl CommandArgs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

/// Result of one command run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    /// Human-readable status line(s).
    pub message: String,
    /// Tasks created or removed.
    pub affected: u64,
    /// Whether the worker should pick up the change. False when the run
    /// left the queue exactly as it was.
    pub reload_worker: bool,
}

impl CommandReport {
    pub fn new(message: impl Into<String>, affected: u64) -> Self {
        Self {
            message: message.into(),
            affected,
            reload_worker: true,
        }
    }

    pub fn without_reload(mut self) -> Self {
        self.reload_worker = false;
        self
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// CLI name, e.g. `cancel-balance`.
    fn name(&self) -> &'static str;

    fn about(&self) -> &'static str;

    /// Can a successful run change what the worker will do next?
    fn restarts_worker(&self) -> bool {
        true
    }

    async fn run(&self, queue: &TaskQueue, args: &CommandArgs) -> Result<CommandReport, CommandError>;
}

/// Lookup table of commands, keyed by name.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    runners: BTreeMap<&'static str, Arc<dyn CommandRunner>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The commands the `poolkeeper` CLI ships with.
    pub fn builtin() -> Self {
        let runners: [Arc<dyn CommandRunner>; 5] = [
            Arc::new(CancelAction::new(
                "cancel-balance",
                "Cancel all pending balance tasks",
                TaskAction::balance(),
            )),
            Arc::new(CancelAction::new(
                "cancel-check",
                "Cancel all pending check tasks",
                TaskAction::check(),
            )),
            Arc::new(ScheduleAction::new(
                "balance",
                "Schedule a balance of the storage pools",
                TaskAction::balance(),
                false,
            )),
            Arc::new(ScheduleAction::new(
                "check",
                "Schedule a check of one directory",
                TaskAction::check(),
                true,
            )),
            Arc::new(ViewQueue),
        ];
        Self {
            runners: runners.into_iter().map(|r| (r.name(), r)).collect(),
        }
    }

    pub fn register(&mut self, runner: Arc<dyn CommandRunner>) -> Result<(), CommandError> {
        let name = runner.name();
        if self.runners.contains_key(name) {
            return Err(CommandError::DuplicateCommand(name.to_string()));
        }
        self.runners.insert(name, runner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.runners.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
