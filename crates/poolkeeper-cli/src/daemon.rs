use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use poolkeeper_core::Worker;
use poolkeeper_core::config::PoolkeeperConfig;
use poolkeeper_core::signal::FlagFileWatcher;
use poolkeeper_core::store::TaskStore;
use tokio::sync::watch;
use tracing::info;

use crate::handlers;

/// Run the worker until SIGINT/SIGTERM.
///
/// Startup order matters: orphans are released before the worker can claim
/// anything, and a flag file left over from while the daemon was down is
/// consumed as the first reload.
pub async fn run(
    config: PoolkeeperConfig,
    config_path: PathBuf,
    store: Arc<dyn TaskStore>,
) -> anyhow::Result<()> {
    let queue = config.queue(store);
    queue
        .recover_orphans()
        .await
        .context("releasing orphaned tasks")?;

    let worker = Worker::new(queue, handlers::builtin()?)
        .with_settings(config.worker.clone())
        .with_settings_source(PoolkeeperConfig::worker_settings_source(config_path))
        .spawn();
    info!(database = %config.database.display(), "worker started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = match config.restart.flag_file() {
        Some(path) => {
            info!(path = %path.display(), "watching for restart requests");
            Some(FlagFileWatcher::new(path, config.worker.control_poll, worker.control()).spawn(shutdown_rx))
        }
        None => {
            info!("restart mode is a service command; commands restart the whole daemon");
            None
        }
    };

    shutdown_signal().await?;
    info!("shutting down, waiting for the current task");

    // ignore send error: the watcher may already have exited
    let _ = shutdown_tx.send(true);
    if let Some(watcher) = watcher {
        watcher.await.context("restart watcher panicked")?;
    }
    worker.shutdown().await?;
    info!("worker stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")
}
