use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Task, TaskAction};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for action={0}")]
    NotFound(TaskAction),

    #[error("duplicate handler for action={0}")]
    Duplicate(TaskAction),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Executes tasks of one action. The actual storage work (moving files
/// between pools, checking copies) lives behind this trait.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

/// Registry of handlers (action -> handler).
///
/// Built during initialization (mutable), shared read-only by the worker,
/// so no lock is needed.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskAction, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        action: impl Into<TaskAction>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), HandlerError> {
        let action = action.into();
        if self.handlers.contains_key(&action) {
            return Err(HandlerError::Duplicate(action));
        }
        self.handlers.insert(action, handler);
        Ok(())
    }

    pub fn get(&self, action: &TaskAction) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(action)
    }

    pub fn actions(&self) -> Vec<TaskAction> {
        let mut actions: Vec<_> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Execute one task by dispatching on its action.
    pub async fn execute(&self, task: &Task) -> Result<(), HandlerError> {
        let handler = self
            .get(&task.action)
            .ok_or_else(|| HandlerError::NotFound(task.action.clone()))?;
        handler.handle(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskId};
    use chrono::Utc;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn task(action: &str) -> Task {
        Task::from_new(
            TaskId::new(1),
            NewTask::new(action, serde_json::json!({})),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("balance", Arc::new(OkHandler)).unwrap();
        reg.execute(&task("balance")).await.unwrap();
    }

    #[tokio::test]
    async fn errors_when_handler_missing() {
        let reg = HandlerRegistry::new();
        let err = reg.execute(&task("check")).await.unwrap_err();
        assert!(err.to_string().contains("no handler"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register("balance", Arc::new(OkHandler)).unwrap();
        let err = reg.register("balance", Arc::new(OkHandler)).unwrap_err();
        assert!(matches!(err, HandlerError::Duplicate(_)));
        assert_eq!(reg.len(), 1);
    }
}
