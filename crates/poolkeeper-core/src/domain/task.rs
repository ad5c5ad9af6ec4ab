//! Task record and the transitions a store applies to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskAction, TaskId, TaskStatus};

/// 9999-12-31T23:59:59Z, the last instant with a four-digit year.
const LATEST_STORABLE_SECS: i64 = 253_402_300_799;

/// Latest timestamp every store can persist and order correctly.
/// Retry times beyond it are clamped to it.
pub fn latest_storable_time() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_STORABLE_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A task as submitted by a producer, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub action: TaskAction,
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(action: impl Into<TaskAction>, payload: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }
}

/// A stored unit of deferred work.
///
/// The payload is opaque to the queue; only handlers interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub action: TaskAction,
    pub payload: serde_json::Value,
    pub status: TaskStatus,

    /// Number of times this task has been claimed (including the current one).
    pub attempts: u32,

    pub last_error: Option<String>,

    /// Earliest instant the task may be claimed again (set on retry).
    pub not_before: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build the pending record for a freshly inserted task.
    pub fn from_new(id: TaskId, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            action: new.action,
            payload: new.payload,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Can the worker take this task at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending() && self.not_before.is_none_or(|at| at <= now)
    }

    /// Apply a transition in place. The caller has already checked the
    /// expected source status.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        match update {
            TaskUpdate::Claim => {
                self.attempts += 1;
                self.not_before = None;
            }
            TaskUpdate::Complete => {
                self.not_before = None;
            }
            TaskUpdate::Retry { error, not_before } => {
                self.last_error = Some(error.clone());
                self.not_before = Some((*not_before).min(latest_storable_time()));
            }
            TaskUpdate::Fail { error } => {
                self.last_error = Some(error.clone());
                self.not_before = None;
            }
            TaskUpdate::Release => {
                self.not_before = None;
            }
        }
        self.status = update.target_status();
        self.updated_at = now;
    }
}

/// Row transitions understood by every store backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Pending -> InProgress, one more attempt.
    Claim,
    /// InProgress -> Done.
    Complete,
    /// InProgress -> Pending, not claimable before `not_before`.
    Retry {
        error: String,
        not_before: DateTime<Utc>,
    },
    /// InProgress -> Failed.
    Fail { error: String },
    /// InProgress -> Pending, used for orphans left by a dead daemon.
    Release,
}

impl TaskUpdate {
    pub fn target_status(&self) -> TaskStatus {
        match self {
            TaskUpdate::Claim => TaskStatus::InProgress,
            TaskUpdate::Complete => TaskStatus::Done,
            TaskUpdate::Retry { .. } | TaskUpdate::Release => TaskStatus::Pending,
            TaskUpdate::Fail { .. } => TaskStatus::Failed,
        }
    }
}
