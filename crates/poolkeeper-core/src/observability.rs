use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{TaskAction, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::InProgress => self.in_progress += n,
            TaskStatus::Done => self.done += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// Queue snapshot for `view-queue` and the worker's reload log line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: StatusCounts,
    pub by_action: BTreeMap<TaskAction, StatusCounts>,
}

impl QueueCounts {
    pub fn record(&mut self, action: TaskAction, status: TaskStatus, n: u64) {
        self.total.add(status, n);
        self.by_action.entry(action).or_default().add(status, n);
    }

    pub fn for_action(&self, action: &TaskAction) -> StatusCounts {
        self.by_action.get(action).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_totals_and_breakdown_in_sync() {
        let mut counts = QueueCounts::default();
        counts.record(TaskAction::balance(), TaskStatus::Pending, 2);
        counts.record(TaskAction::balance(), TaskStatus::InProgress, 1);
        counts.record(TaskAction::check(), TaskStatus::Pending, 1);

        assert_eq!(counts.total.pending, 3);
        assert_eq!(counts.total.total(), 4);
        assert_eq!(counts.for_action(&TaskAction::balance()).in_progress, 1);
        assert_eq!(counts.for_action(&TaskAction::repair()), StatusCounts::default());
    }
}
