/// Out-of-band messages for a running worker.
///
/// They are only acted on between tasks; a task being executed always runs
/// to completion (or an explicit failure record) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Re-read settings and the queue view, then poll immediately.
    Reload,
    /// Stop claiming new tasks until `Resume`.
    Pause,
    Resume,
    /// Finish the current task and exit.
    Shutdown,
}
