use std::collections::HashSet;

use crate::domain::TaskAction;

/// Per-action enqueue rules.
///
/// An "idempotent" action never has two pending tasks with the same payload;
/// enqueueing a duplicate is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    idempotent: HashSet<TaskAction>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotent<I, A>(actions: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<TaskAction>,
    {
        Self {
            idempotent: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declare_idempotent(&mut self, action: impl Into<TaskAction>) -> &mut Self {
        self.idempotent.insert(action.into());
        self
    }

    pub fn is_idempotent(&self, action: &TaskAction) -> bool {
        self.idempotent.contains(action)
    }
}

impl From<Vec<String>> for ActionCatalog {
    fn from(actions: Vec<String>) -> Self {
        Self::with_idempotent(actions.into_iter().map(TaskAction::new))
    }
}
