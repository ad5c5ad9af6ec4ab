//! Store predicate expressed as data, so each backend can translate it.

use chrono::{DateTime, Utc};

use super::{Task, TaskAction, TaskId, TaskStatus};
use crate::error::StoreError;

/// Conjunction of optional equality constraints. Results are always ordered
/// by ascending id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub id: Option<TaskId>,
    pub action: Option<TaskAction>,
    pub status: Option<TaskStatus>,
    pub payload: Option<serde_json::Value>,

    /// Only rows whose `not_before` is unset or not later than this instant.
    pub ready_at: Option<DateTime<Utc>>,

    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn action(mut self, action: impl Into<TaskAction>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn ready_at(mut self, now: DateTime<Utc>) -> Self {
        self.ready_at = Some(now);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject predicates no backend should run.
    pub fn validate(&self) -> Result<(), StoreError> {
        if let Some(action) = &self.action
            && action.is_empty()
        {
            return Err(StoreError::Malformed("empty action in filter".to_string()));
        }
        if self.limit == Some(0) {
            return Err(StoreError::Malformed("filter limit must be > 0".to_string()));
        }
        Ok(())
    }

    /// Evaluate the predicate against one record (limit is not considered).
    pub fn matches(&self, task: &Task) -> bool {
        self.id.is_none_or(|id| task.id == id)
            && self.action.as_ref().is_none_or(|a| &task.action == a)
            && self.status.is_none_or(|s| task.status == s)
            && self.payload.as_ref().is_none_or(|p| &task.payload == p)
            && self
                .ready_at
                .is_none_or(|now| task.not_before.is_none_or(|at| at <= now))
    }
}
