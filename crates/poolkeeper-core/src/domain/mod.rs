//! Domain model: ids, actions, status, task records and store predicates.

pub mod action;
pub mod filter;
pub mod ids;
pub mod status;
pub mod task;

pub use self::action::TaskAction;
pub use self::filter::TaskFilter;
pub use self::ids::TaskId;
pub use self::status::TaskStatus;
pub use self::task::{NewTask, Task, TaskUpdate, latest_storable_time};
