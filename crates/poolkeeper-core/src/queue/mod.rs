//! Task queue: the only owner of the task lifecycle.
//!
//! Commands and the worker go through [`TaskQueue`]; nothing else touches a
//! [`TaskStore`] directly. The status rules live here once:
//! - cancellation only ever removes `Pending` rows,
//! - claiming is a compare-and-set `Pending -> InProgress`,
//! - completion / failure are compare-and-sets out of `InProgress`.

mod catalog;
mod retry;

pub use catalog::ActionCatalog;
pub use retry::RetryPolicy;
pub(crate) use retry::millis;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::{
    NewTask, Task, TaskAction, TaskFilter, TaskId, TaskStatus, TaskUpdate, latest_storable_time,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::store::TaskStore;

/// How many pending candidates `claim_next` reads per round trip.
const CLAIM_BATCH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Created(Task),
    /// The action is idempotent and an identical pending task already exists.
    Deduplicated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back to pending, claimable again from `at`.
    Retrying { task: Task, at: DateTime<Utc> },
    /// Retry budget exhausted.
    Failed(Task),
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    catalog: ActionCatalog,
    retry: RetryPolicy,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            catalog: ActionCatalog::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_catalog(mut self, catalog: ActionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Insert a pending task. Idempotent actions are deduplicated on
    /// `(action, payload)` among pending tasks, atomically in the store.
    pub async fn enqueue(
        &self,
        action: impl Into<TaskAction>,
        payload: serde_json::Value,
    ) -> Result<EnqueueOutcome, StoreError> {
        let new = NewTask::new(action, payload);
        if self.catalog.is_idempotent(&new.action) {
            let action = new.action.clone();
            return match self.store.insert_unique(new).await? {
                Some(task) => {
                    debug!(task_id = %task.id, %action, "enqueued");
                    Ok(EnqueueOutcome::Created(task))
                }
                None => {
                    debug!(%action, "identical pending task exists, not enqueued");
                    Ok(EnqueueOutcome::Deduplicated)
                }
            };
        }
        let task = self.store.insert(new).await?;
        debug!(task_id = %task.id, action = %task.action, "enqueued");
        Ok(EnqueueOutcome::Created(task))
    }

    /// Delete every *pending* task with this action. In-progress tasks are
    /// left alone so the worker can still record their outcome.
    pub async fn cancel_by_action(&self, action: &TaskAction) -> Result<u64, StoreError> {
        let filter = TaskFilter::all()
            .action(action.clone())
            .status(TaskStatus::Pending);
        let cancelled = self.store.delete_where(&filter).await?;
        info!(%action, cancelled, "cancelled pending tasks");
        Ok(cancelled)
    }

    /// Claim the oldest ready pending task (`Pending -> InProgress`).
    ///
    /// A candidate that loses its compare-and-set (claimed by another worker,
    /// or deleted by a cancellation in between) is skipped.
    pub async fn claim_next(&self) -> Result<Option<Task>, StoreError> {
        loop {
            let filter = TaskFilter::all()
                .status(TaskStatus::Pending)
                .ready_at(Utc::now())
                .limit(CLAIM_BATCH);
            let candidates = self.store.find(&filter).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                match self
                    .store
                    .compare_and_set(candidate.id, TaskStatus::Pending, TaskUpdate::Claim)
                    .await
                {
                    Ok(task) => {
                        debug!(task_id = %task.id, action = %task.action, attempts = task.attempts, "claimed");
                        return Ok(Some(task));
                    }
                    Err(StoreError::ClaimConflict { .. } | StoreError::NotFound(_)) => {
                        debug!(task_id = %candidate.id, "lost claim race, trying next");
                    }
                    Err(e) => return Err(e),
                }
            }
            // every candidate was taken from under us; read a fresh batch
        }
    }

    /// `InProgress -> Done`.
    pub async fn complete(&self, id: TaskId) -> Result<Task, StoreError> {
        self.store
            .compare_and_set(id, TaskStatus::InProgress, TaskUpdate::Complete)
            .await
    }

    /// Record a failed attempt. The retry policy decides between another
    /// attempt later and a terminal `Failed`.
    pub async fn fail(&self, id: TaskId, reason: impl Into<String>) -> Result<FailOutcome, StoreError> {
        let error = reason.into();
        let current = self
            .store
            .find(&TaskFilter::all().id(id))
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))?;

        if self.retry.exhausted(current.attempts) {
            let task = self
                .store
                .compare_and_set(id, TaskStatus::InProgress, TaskUpdate::Fail { error })
                .await?;
            warn!(task_id = %id, attempts = task.attempts, "task failed permanently");
            return Ok(FailOutcome::Failed(task));
        }

        let delay = self.retry.next_delay(current.attempts);
        let latest = latest_storable_time();
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .map_or(latest, |at| at.min(latest));
        let task = self
            .store
            .compare_and_set(
                id,
                TaskStatus::InProgress,
                TaskUpdate::Retry {
                    error,
                    not_before: at,
                },
            )
            .await?;
        info!(task_id = %id, attempts = task.attempts, retry_at = %at, "task will be retried");
        Ok(FailOutcome::Retrying { task, at })
    }

    /// Put tasks left `InProgress` by a daemon that died mid-task back to
    /// pending. Only call this before the worker starts claiming.
    pub async fn recover_orphans(&self) -> Result<u64, StoreError> {
        let orphans = self
            .store
            .find(&TaskFilter::all().status(TaskStatus::InProgress))
            .await?;
        let mut released = 0;
        for orphan in orphans {
            match self
                .store
                .compare_and_set(orphan.id, TaskStatus::InProgress, TaskUpdate::Release)
                .await
            {
                Ok(_) => released += 1,
                Err(StoreError::ClaimConflict { .. } | StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if released > 0 {
            warn!(released, "released orphaned in-progress tasks");
        }
        Ok(released)
    }

    /// Completion cleanup: drop `Done` rows.
    pub async fn purge_done(&self) -> Result<u64, StoreError> {
        self.store
            .delete_where(&TaskFilter::all().status(TaskStatus::Done))
            .await
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self
            .store
            .find(&TaskFilter::all().id(id))
            .await?
            .into_iter()
            .next())
    }

    /// Pending tasks in claim order.
    pub async fn pending(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError> {
        let mut filter = TaskFilter::all().status(TaskStatus::Pending);
        filter.limit = limit;
        self.store.find(&filter).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.store.counts().await
    }
}
