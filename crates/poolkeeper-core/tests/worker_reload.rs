use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use poolkeeper_core::command::CommandArgs;
use poolkeeper_core::signal::{ChannelSignal, FlagFileSignal, FlagFileWatcher};
use poolkeeper_core::store::SqliteTaskStore;
use poolkeeper_core::worker::{HandlerError, HandlerRegistry, TaskHandler, WorkerSettings};
use poolkeeper_core::{
    CommandDispatcher, CommandRegistry, ControlMessage, Task, TaskAction, TaskQueue, Worker,
};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<TaskAction>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<TaskAction> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(task.action.clone());
        Ok(())
    }
}

fn handlers(recorder: &Recorder) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for action in [TaskAction::balance(), TaskAction::check()] {
        registry.register(action, Arc::new(recorder.clone())).unwrap();
    }
    registry
}

fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        control_poll: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn cancelled_work_is_never_executed_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteTaskStore::open(dir.path().join("tasks.sqlite")).unwrap());
    let queue = TaskQueue::new(store);
    let recorder = Recorder::default();

    let worker = Worker::new(queue.clone(), handlers(&recorder))
        .with_settings(fast_settings())
        .spawn();
    worker.send(ControlMessage::Pause).await.unwrap();
    timeout(WAIT, worker.wait_for(|s| s.paused)).await.unwrap().unwrap();

    queue.enqueue("balance", json!({})).await.unwrap();
    queue.enqueue("check", json!({"path": "/mnt/pool/a"})).await.unwrap();

    let dispatcher = CommandDispatcher::new(
        CommandRegistry::builtin(),
        queue.clone(),
        Arc::new(ChannelSignal::new(worker.control())),
    );
    let outcome = dispatcher
        .dispatch("cancel-balance", &CommandArgs::none())
        .await
        .unwrap();
    assert_eq!(outcome.report.affected, 1);
    timeout(WAIT, worker.wait_for(|s| s.reloads == 1)).await.unwrap().unwrap();

    worker.send(ControlMessage::Resume).await.unwrap();
    timeout(WAIT, worker.wait_for(|s| s.executed == 1)).await.unwrap().unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(recorder.seen(), vec![TaskAction::check()]);
}

#[tokio::test]
async fn flag_file_request_reaches_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("run").join("restart.json");
    let store = Arc::new(SqliteTaskStore::open(dir.path().join("tasks.sqlite")).unwrap());
    let queue = TaskQueue::new(store.clone());
    let recorder = Recorder::default();

    let worker = Worker::new(queue.clone(), handlers(&recorder))
        .with_settings(fast_settings())
        .spawn();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = FlagFileWatcher::new(&flag, Duration::from_millis(20), worker.control()).spawn(shutdown_rx);

    // the command side runs in another process in production: own store handle, no channel
    let cli_store = Arc::new(SqliteTaskStore::open(dir.path().join("tasks.sqlite")).unwrap());
    let dispatcher = CommandDispatcher::new(
        CommandRegistry::builtin(),
        TaskQueue::new(cli_store),
        Arc::new(FlagFileSignal::new(&flag)),
    );
    dispatcher
        .dispatch("cancel-balance", &CommandArgs::none())
        .await
        .unwrap();

    timeout(WAIT, worker.wait_for(|s| s.reloads >= 1)).await.unwrap().unwrap();
    timeout(WAIT, async {
        while flag.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    watcher.await.unwrap();
    worker.shutdown().await.unwrap();
    assert!(recorder.seen().is_empty());
}
