//! Worker: the long-running poll/execute loop.
//!
//! State machine: `Idle -> Polling -> Executing -> Idle`.
//! Control messages (reload, pause, shutdown) are only consumed while idle,
//! i.e. between two tasks. A task that has been claimed is always driven to
//! `complete` or `fail` before anything else happens.

mod control;
mod handler;

pub use control::ControlMessage;
pub use handler::{HandlerError, HandlerRegistry, TaskHandler};

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ConfigError;
use crate::domain::{Task, TaskId};
use crate::queue::{TaskQueue, millis};

const CONTROL_CAPACITY: usize = 32;

/// Floor for every sleep in the loop, so a zero interval cannot spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How many times a transient store error may delay recording a task
/// outcome before the worker gives up and leaves the row in progress.
const SETTLE_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker has stopped")]
    Stopped,

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Settings the worker re-reads on every reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Sleep between polls of an empty queue.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,

    /// Cap for the backoff while the store is unavailable.
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,

    /// How often the daemon checks for a restart request.
    #[serde(rename = "control_poll_ms", with = "millis")]
    pub control_poll: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            control_poll: Duration::from_millis(500),
        }
    }
}

/// Where reloadable settings come from (usually the config file).
pub type SettingsSource = Arc<dyn Fn() -> Result<WorkerSettings, ConfigError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Idle,
    Polling,
    Executing,
    Stopped,
}

/// What the worker is doing right now, published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub current: Option<TaskId>,
    pub paused: bool,
    pub reloads: u64,
    pub executed: u64,
}

pub struct Worker {
    queue: TaskQueue,
    handlers: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    settings_source: Option<SettingsSource>,
}

impl Worker {
    pub fn new(queue: TaskQueue, handlers: HandlerRegistry) -> Self {
        Self {
            queue,
            handlers: Arc::new(handlers),
            settings: WorkerSettings::default(),
            settings_source: None,
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_settings_source(mut self, source: SettingsSource) -> Self {
        self.settings_source = Some(source);
        self
    }

    /// Start the loop on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(WorkerSnapshot::default());

        let backoff = Backoff::new(self.settings.poll_interval, self.settings.max_backoff);
        let worker_loop = WorkerLoop {
            queue: self.queue,
            handlers: self.handlers,
            settings: self.settings,
            settings_source: self.settings_source,
            control_rx,
            snapshot: snapshot_tx,
            backoff,
            paused: false,
        };
        let join = tokio::spawn(worker_loop.run());

        WorkerHandle {
            control: control_tx,
            snapshot: snapshot_rx,
            join,
        }
    }
}

/// Handle to a spawned worker.
/// - dropping every control sender stops the worker, like `Shutdown`
/// - `shutdown()` waits for the current task to be settled
pub struct WorkerHandle {
    control: mpsc::Sender<ControlMessage>,
    snapshot: watch::Receiver<WorkerSnapshot>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Sender for the control channel (hand it to a watcher or a
    /// `ChannelSignal`).
    pub fn control(&self) -> mpsc::Sender<ControlMessage> {
        self.control.clone()
    }

    pub async fn send(&self, message: ControlMessage) -> Result<(), WorkerError> {
        self.control
            .send(message)
            .await
            .map_err(|_| WorkerError::Stopped)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&WorkerSnapshot) -> bool,
    ) -> Result<WorkerSnapshot, WorkerError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| WorkerError::Stopped)?;
        Ok(snapshot.clone())
    }

    pub async fn shutdown(self) -> Result<(), WorkerError> {
        // ignore send error: the loop may already be gone
        let _ = self.control.send(ControlMessage::Shutdown).await;
        self.join.await?;
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop,
}

struct WorkerLoop {
    queue: TaskQueue,
    handlers: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    settings_source: Option<SettingsSource>,
    control_rx: mpsc::Receiver<ControlMessage>,
    snapshot: watch::Sender<WorkerSnapshot>,
    backoff: Backoff,
    paused: bool,
}

impl WorkerLoop {
    async fn run(mut self) {
        info!(actions = ?self.handlers.actions(), "worker started");

        'run: loop {
            // Idle boundary: handle whatever arrived while we were busy
            while let Ok(message) = self.control_rx.try_recv() {
                if let Flow::Stop = self.on_control(message).await {
                    break 'run;
                }
            }

            if self.paused {
                match self.control_rx.recv().await {
                    Some(message) => {
                        if let Flow::Stop = self.on_control(message).await {
                            break 'run;
                        }
                    }
                    None => break 'run,
                }
                continue;
            }

            self.publish(|s| s.state = WorkerState::Polling);
            let wait = match self.queue.claim_next().await {
                Ok(Some(task)) => {
                    self.backoff.reset();
                    self.execute(task).await;
                    continue;
                }
                Ok(None) => {
                    self.backoff.reset();
                    self.settings.poll_interval.max(MIN_POLL_INTERVAL)
                }
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "task store unavailable");
                    delay
                }
                Err(e) => {
                    error!(error = %e, "polling the queue failed");
                    self.settings.poll_interval.max(MIN_POLL_INTERVAL)
                }
            };
            self.publish(|s| s.state = WorkerState::Idle);

            tokio::select! {
                message = self.control_rx.recv() => match message {
                    Some(message) => {
                        if let Flow::Stop = self.on_control(message).await {
                            break 'run;
                        }
                    }
                    None => break 'run,
                },
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.publish(|s| {
            s.state = WorkerState::Stopped;
            s.current = None;
        });
        info!("worker stopped");
    }

    async fn on_control(&mut self, message: ControlMessage) -> Flow {
        debug!(?message, "control message");
        match message {
            ControlMessage::Reload => {
                self.reload().await;
                Flow::Continue
            }
            ControlMessage::Pause => {
                if !self.paused {
                    info!("worker paused");
                }
                self.paused = true;
                self.publish(|s| s.paused = true);
                Flow::Continue
            }
            ControlMessage::Resume => {
                if self.paused {
                    info!("worker resumed");
                }
                self.paused = false;
                self.publish(|s| s.paused = false);
                Flow::Continue
            }
            ControlMessage::Shutdown => Flow::Stop,
        }
    }

    /// Re-read settings and the queue view. Runs between tasks only, so
    /// nothing is in progress on this worker.
    async fn reload(&mut self) {
        if let Some(source) = &self.settings_source {
            match source() {
                Ok(settings) => {
                    self.backoff = Backoff::new(settings.poll_interval, settings.max_backoff);
                    self.settings = settings;
                }
                Err(e) => warn!(error = %e, "keeping current worker settings"),
            }
        }

        match self.queue.purge_done().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged done tasks"),
            Err(e) => warn!(error = %e, "could not purge done tasks"),
        }
        match self.queue.counts().await {
            Ok(counts) => info!(
                pending = counts.total.pending,
                in_progress = counts.total.in_progress,
                failed = counts.total.failed,
                "queue view reloaded"
            ),
            Err(e) => warn!(error = %e, "queue view reloaded without counts"),
        }
        self.publish(|s| s.reloads += 1);
    }

    async fn execute(&mut self, task: Task) {
        let id = task.id;
        self.publish(|s| {
            s.state = WorkerState::Executing;
            s.current = Some(id);
        });

        let span = info_span!("task", task_id = %id, action = %task.action, attempt = task.attempts);
        let outcome = self.handlers.execute(&task).instrument(span).await;
        match &outcome {
            Ok(()) => info!(task_id = %id, action = %task.action, "task done"),
            Err(e) => warn!(task_id = %id, action = %task.action, error = %e, "task failed"),
        }
        self.settle(id, outcome).await;

        self.publish(|s| {
            s.state = WorkerState::Idle;
            s.current = None;
            s.executed += 1;
        });
    }

    /// Record the outcome of a claimed task, riding out short store outages.
    async fn settle(&mut self, id: TaskId, outcome: Result<(), HandlerError>) {
        let reason = outcome.err().map(|e| e.to_string());
        for attempt in 1..=SETTLE_ATTEMPTS {
            let recorded = match &reason {
                None => self.queue.complete(id).await.map(|_| ()),
                Some(reason) => self.queue.fail(id, reason.clone()).await.map(|_| ()),
            };
            match recorded {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < SETTLE_ATTEMPTS => {
                    let delay = self.backoff.next_delay();
                    warn!(task_id = %id, error = %e, attempt, "could not record outcome, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // left in progress; recover_orphans() picks it up on next start
                    error!(task_id = %id, error = %e, "giving up recording task outcome");
                    return;
                }
            }
        }
    }

    fn publish(&self, update: impl FnOnce(&mut WorkerSnapshot)) {
        self.snapshot.send_modify(update);
    }
}

/// Exponential backoff with up to 25% jitter.
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_POLL_INTERVAL);
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = delay.checked_mul(2).unwrap_or(self.max).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        delay + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskAction, TaskStatus};
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast() -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            control_poll: Duration::from_millis(10),
        }
    }

    /// Records every task it sees.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(task.id);
            Ok(())
        }
    }

    /// Blocks until released, so a test can act while a task is executing.
    struct Gate {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TaskHandler for Gate {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            Err(HandlerError::Failed("pool offline".to_string()))
        }
    }

    #[tokio::test]
    async fn executes_each_task_once() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()));
        for _ in 0..3 {
            queue.enqueue("balance", json!({})).await.unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register("balance", recorder.clone()).unwrap();

        let handle = Worker::new(queue.clone(), handlers).with_settings(fast()).spawn();
        timeout(WAIT, handle.wait_for(|s| s.executed == 3)).await.unwrap().unwrap();
        handle.shutdown().await.unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![TaskId::new(1), TaskId::new(2), TaskId::new(3)]);
        assert_eq!(queue.counts().await.unwrap().total.done, 3);
    }

    #[tokio::test]
    async fn reload_waits_for_in_flight_task() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()));
        queue.enqueue("balance", json!({})).await.unwrap();
        let gate = Arc::new(Gate {
            started: Notify::new(),
            release: Notify::new(),
        });
        let mut handlers = HandlerRegistry::new();
        handlers.register("balance", gate.clone()).unwrap();

        let handle = Worker::new(queue.clone(), handlers).with_settings(fast()).spawn();
        timeout(WAIT, gate.started.notified()).await.unwrap();

        // cancellation + reload while the claimed task is running
        assert_eq!(queue.cancel_by_action(&TaskAction::balance()).await.unwrap(), 0);
        handle.send(ControlMessage::Reload).await.unwrap();
        assert_eq!(handle.snapshot().state, WorkerState::Executing);
        assert_eq!(handle.snapshot().reloads, 0);

        gate.release.notify_one();
        let snapshot = timeout(WAIT, handle.wait_for(|s| s.reloads == 1)).await.unwrap().unwrap();
        assert_eq!(snapshot.executed, 1);
        handle.shutdown().await.unwrap();

        // completed, then purged by the reload
        assert_eq!(queue.counts().await.unwrap().total.total(), 0);
    }

    #[tokio::test]
    async fn cancelled_tasks_are_not_executed_after_reload() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()));
        let recorder = Arc::new(Recorder::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register("balance", recorder.clone()).unwrap();
        handlers.register("check", recorder.clone()).unwrap();

        let handle = Worker::new(queue.clone(), handlers).with_settings(fast()).spawn();
        handle.send(ControlMessage::Pause).await.unwrap();
        timeout(WAIT, handle.wait_for(|s| s.paused)).await.unwrap().unwrap();

        queue.enqueue("balance", json!({})).await.unwrap();
        let check = match queue.enqueue("check", json!({})).await.unwrap() {
            crate::queue::EnqueueOutcome::Created(task) => task,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(queue.cancel_by_action(&TaskAction::balance()).await.unwrap(), 1);

        handle.send(ControlMessage::Reload).await.unwrap();
        handle.send(ControlMessage::Resume).await.unwrap();
        timeout(WAIT, handle.wait_for(|s| s.executed == 1)).await.unwrap().unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(recorder.seen.lock().unwrap().clone(), vec![check.id]);
    }

    #[tokio::test]
    async fn failing_task_is_marked_failed_not_fatal() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()))
            .with_retry_policy(crate::queue::RetryPolicy::no_retry());
        queue.enqueue("repair", json!({})).await.unwrap();
        queue.enqueue("orphaned-action", json!({})).await.unwrap();
        let mut handlers = HandlerRegistry::new();
        handlers.register("repair", Arc::new(AlwaysFails)).unwrap();

        let handle = Worker::new(queue.clone(), handlers).with_settings(fast()).spawn();
        timeout(WAIT, handle.wait_for(|s| s.executed == 2)).await.unwrap().unwrap();
        assert_ne!(handle.snapshot().state, WorkerState::Stopped);
        handle.shutdown().await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.total.failed, 2);
        let repair = queue.get(TaskId::new(1)).await.unwrap().unwrap();
        assert_eq!(repair.status, TaskStatus::Failed);
        assert_eq!(repair.last_error.as_deref(), Some("pool offline"));
    }

    #[tokio::test]
    async fn survives_store_outage() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()));
        let recorder = Arc::new(Recorder::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register("check", recorder.clone()).unwrap();

        store.set_available(false);
        let handle = Worker::new(queue.clone(), handlers).with_settings(fast()).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(handle.snapshot().state, WorkerState::Stopped);

        store.set_available(true);
        queue.enqueue("check", json!({})).await.unwrap();
        timeout(WAIT, handle.wait_for(|s| s.executed == 1)).await.unwrap().unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reload_applies_new_settings() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::new(Arc::new(store));
        let source: SettingsSource = Arc::new(|| {
            Ok(WorkerSettings {
                poll_interval: Duration::from_millis(20),
                ..WorkerSettings::default()
            })
        });
        let handle = Worker::new(queue, HandlerRegistry::new())
            .with_settings(fast())
            .with_settings_source(source)
            .spawn();
        handle.send(ControlMessage::Reload).await.unwrap();
        timeout(WAIT, handle.wait_for(|s| s.reloads == 1)).await.unwrap().unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_control_senders_stops_the_worker() {
        let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()));
        let handle = Worker::new(queue, HandlerRegistry::new()).with_settings(fast()).spawn();
        let WorkerHandle {
            control,
            snapshot,
            join,
        } = handle;
        drop(control);
        timeout(WAIT, join).await.unwrap().unwrap();
        assert_eq!(snapshot.borrow().state, WorkerState::Stopped);
    }

    #[test]
    fn backoff_grows_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        backoff.next_delay();
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(375));
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(125));
    }

    #[test]
    fn zero_interval_is_floored() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert!(backoff.next_delay() >= MIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn subscribers_see_the_worker_stop() {
        let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()));
        let handle = Worker::new(queue, HandlerRegistry::new()).with_settings(fast()).spawn();
        let mut updates = handle.subscribe();
        assert_eq!(handle.snapshot().executed, 0);

        handle.shutdown().await.unwrap();
        assert_eq!(updates.borrow_and_update().state, WorkerState::Stopped);
    }
}
