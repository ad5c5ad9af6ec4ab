//! In-memory store implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::TaskStore;
use crate::domain::{NewTask, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate};
use crate::error::StoreError;
use crate::observability::QueueCounts;

/// In-memory store state.
struct InMemoryStoreState {
    /// All task records, keyed (and therefore ordered) by id.
    records: BTreeMap<TaskId, Task>,

    /// Next id to assign. Never rewinds, so deleted ids are not reused.
    next_task_id: u64,
}

impl InMemoryStoreState {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_task_id: 1,
        }
    }

    fn allocate_task_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    fn insert(&mut self, new: NewTask) -> Task {
        let id = self.allocate_task_id();
        let task = Task::from_new(id, new, Utc::now());
        self.records.insert(id, task.clone());
        task
    }
}

/// In-memory store. Good for tests and single-process demos; nothing
/// survives the process.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    available: Arc<AtomicBool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a lost connection: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Insert a record as-is (any status). Lets tests build a queue that
    /// already has in-flight work.
    pub async fn seed(&self, new: NewTask, status: TaskStatus) -> Task {
        let mut state = self.state.lock().await;
        let mut task = state.insert(new);
        task.status = status;
        if status == TaskStatus::InProgress {
            task.attempts = 1;
        }
        state.records.insert(task.id, task.clone());
        task
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError> {
        self.check_available()?;
        if task.action.is_empty() {
            return Err(StoreError::Malformed("task action must not be empty".to_string()));
        }
        let mut state = self.state.lock().await;
        Ok(state.insert(task))
    }

    async fn insert_unique(&self, task: NewTask) -> Result<Option<Task>, StoreError> {
        self.check_available()?;
        if task.action.is_empty() {
            return Err(StoreError::Malformed("task action must not be empty".to_string()));
        }
        let mut state = self.state.lock().await;
        let duplicate = TaskFilter::all()
            .action(task.action.clone())
            .status(TaskStatus::Pending)
            .payload(task.payload.clone());
        if state.records.values().any(|t| duplicate.matches(t)) {
            return Ok(None);
        }
        Ok(Some(state.insert(task)))
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        filter.validate()?;
        let state = self.state.lock().await;
        let matching = state.records.values().filter(|t| filter.matches(t)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn delete_where(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        self.check_available()?;
        filter.validate()?;
        let mut state = self.state.lock().await;
        let mut doomed: Vec<TaskId> = state
            .records
            .values()
            .filter(|t| filter.matches(t))
            .map(|t| t.id)
            .collect();
        if let Some(limit) = filter.limit {
            doomed.truncate(limit);
        }
        for id in &doomed {
            state.records.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn compare_and_set(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<Task, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status != expected {
            return Err(StoreError::ClaimConflict {
                id,
                expected,
                actual: record.status,
            });
        }
        record.apply(&update, Utc::now());
        Ok(record.clone())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            counts.record(record.action.clone(), record.status, 1);
        }
        Ok(counts)
    }
}
