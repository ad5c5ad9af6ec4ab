//! The built-in command variants. They are parameterised by action so that
//! `cancel-balance` and `cancel-check` (or `balance` and `check`) share one
//! implementation.

use std::fmt::Write as _;

use async_trait::async_trait;
use serde_json::json;

use super::{CommandArgs, CommandReport, CommandRunner};
use crate::domain::TaskAction;
use crate::error::CommandError;
use crate::observability::StatusCounts;
use crate::queue::{EnqueueOutcome, TaskQueue};

/// Cancel every pending task of one action.
pub struct CancelAction {
    name: &'static str,
    about: &'static str,
    action: TaskAction,
}

impl CancelAction {
    pub fn new(name: &'static str, about: &'static str, action: TaskAction) -> Self {
        Self { name, about, action }
    }
}

#[async_trait]
impl CommandRunner for CancelAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn about(&self) -> &'static str {
        self.about
    }

    async fn run(&self, queue: &TaskQueue, _args: &CommandArgs) -> Result<CommandReport, CommandError> {
        let cancelled = queue.cancel_by_action(&self.action).await?;
        let message = if cancelled == 0 {
            format!("No pending {} tasks found.", self.action)
        } else {
            format!("Cancelled {cancelled} pending {} task(s).", self.action)
        };
        Ok(CommandReport::new(message, cancelled))
    }
}

/// Schedule one task of an action, optionally scoped to a path.
pub struct ScheduleAction {
    name: &'static str,
    about: &'static str,
    action: TaskAction,
    requires_path: bool,
}

impl ScheduleAction {
    pub fn new(name: &'static str, about: &'static str, action: TaskAction, requires_path: bool) -> Self {
        Self {
            name,
            about,
            action,
            requires_path,
        }
    }

    fn payload(&self, args: &CommandArgs) -> Result<serde_json::Value, CommandError> {
        match args.path.as_deref().map(str::trim) {
            Some("") => Err(CommandError::InvalidArgument {
                command: self.name,
                reason: "path must not be empty".to_string(),
            }),
            Some(path) => Ok(json!({ "path": path })),
            None if self.requires_path => Err(CommandError::InvalidArgument {
                command: self.name,
                reason: "a path is required".to_string(),
            }),
            None => Ok(json!({})),
        }
    }
}

#[async_trait]
impl CommandRunner for ScheduleAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn about(&self) -> &'static str {
        self.about
    }

    async fn run(&self, queue: &TaskQueue, args: &CommandArgs) -> Result<CommandReport, CommandError> {
        let payload = self.payload(args)?;
        match queue.enqueue(self.action.clone(), payload).await? {
            EnqueueOutcome::Created(task) => Ok(CommandReport::new(
                format!("Scheduled {} task {}.", self.action, task.id),
                1,
            )),
            EnqueueOutcome::Deduplicated => Ok(CommandReport::new(
                format!("A pending {} task already exists; nothing scheduled.", self.action),
                0,
            )
            .without_reload()),
        }
    }
}

/// Print queue counts per action. Read-only, so no restart.
pub struct ViewQueue;

#[async_trait]
impl CommandRunner for ViewQueue {
    fn name(&self) -> &'static str {
        "view-queue"
    }

    fn about(&self) -> &'static str {
        "Show queued tasks per action and status"
    }

    fn restarts_worker(&self) -> bool {
        false
    }

    async fn run(&self, queue: &TaskQueue, _args: &CommandArgs) -> Result<CommandReport, CommandError> {
        let counts = queue.counts().await?;
        if counts.total.total() == 0 {
            return Ok(CommandReport::new("Queue is empty.", 0));
        }

        let mut table = format!(
            "{:<16} {:>8} {:>12} {:>8} {:>8}\n",
            "action", "pending", "in-progress", "done", "failed"
        );
        for (action, row) in &counts.by_action {
            push_row(&mut table, action.as_str(), row);
        }
        push_row(&mut table, "total", &counts.total);
        Ok(CommandReport::new(table.trim_end(), 0))
    }
}

fn push_row(table: &mut String, label: &str, row: &StatusCounts) {
    // writing into a String cannot fail
    let _ = writeln!(
        table,
        "{:<16} {:>8} {:>12} {:>8} {:>8}",
        label, row.pending, row.in_progress, row.done, row.failed
    );
}
