use serde::{Deserialize, Serialize};
use std::fmt;

/// Action tag of a task. Decides which handler the worker dispatches to.
///
/// The set is open-ended; the well-known tags are provided as constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskAction(String);

impl TaskAction {
    pub const BALANCE: &'static str = "balance";
    pub const CHECK: &'static str = "check";
    pub const REPAIR: &'static str = "repair";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn balance() -> Self {
        Self::new(Self::BALANCE)
    }

    pub fn check() -> Self {
        Self::new(Self::CHECK)
    }

    pub fn repair() -> Self {
        Self::new(Self::REPAIR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for TaskAction {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
