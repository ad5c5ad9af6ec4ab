//! Task store: the persisted collection of task records.
//!
//! Stores know nothing about task semantics (uniqueness rules, retry,
//! which statuses a command may touch); that lives in [`crate::queue`].
//! Every method is atomic with respect to the other methods.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;

use crate::domain::{NewTask, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate};
use crate::error::StoreError;
use crate::observability::QueueCounts;

/// Store port (interface).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a pending task and return it with its assigned id.
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Insert unless a pending task with the same action and payload exists.
    /// Returns `None` when the insert was skipped.
    async fn insert_unique(&self, task: NewTask) -> Result<Option<Task>, StoreError>;

    /// Snapshot of matching tasks, ordered by id.
    async fn find(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Remove every matching task and return how many were removed.
    async fn delete_where(&self, filter: &TaskFilter) -> Result<u64, StoreError>;

    /// Apply `update` to one row iff its status is still `expected`.
    async fn compare_and_set(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<Task, StoreError>;

    /// Row counts grouped by action and status.
    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
