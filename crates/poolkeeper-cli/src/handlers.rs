//! Handlers the daemon ships with.
//!
//! Moving files between pools and verifying copies is the storage layer's
//! job; these handlers validate the payload and record the work.

use std::sync::Arc;

use async_trait::async_trait;
use poolkeeper_core::domain::{Task, TaskAction};
use poolkeeper_core::worker::{HandlerError, HandlerRegistry, TaskHandler};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct PathPayload {
    path: String,
}

/// balance: payload is ignored.
struct BalanceHandler;

#[async_trait]
impl TaskHandler for BalanceHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        info!(task_id = %task.id, attempts = task.attempts, "balance pass");
        Ok(())
    }
}

/// check / repair: `{"path": "..."}`.
struct PathHandler {
    action: TaskAction,
}

#[async_trait]
impl TaskHandler for PathHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: PathPayload = serde_json::from_value(task.payload.clone())?;
        if payload.path.trim().is_empty() {
            return Err(HandlerError::Failed(format!("{} needs a non-empty path", self.action)));
        }
        info!(task_id = %task.id, action = %self.action, path = %payload.path, "path task");
        Ok(())
    }
}

pub fn builtin() -> Result<HandlerRegistry, HandlerError> {
    let mut registry = HandlerRegistry::new();
    registry.register(TaskAction::balance(), Arc::new(BalanceHandler))?;
    for action in [TaskAction::check(), TaskAction::repair()] {
        registry.register(action.clone(), Arc::new(PathHandler { action }))?;
    }
    Ok(registry)
}
