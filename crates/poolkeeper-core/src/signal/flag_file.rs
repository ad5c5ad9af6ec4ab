//! Flag-file delivery.
//!
//! The command side writes the request as JSON next to the daemon. The
//! daemon's watcher renames it to `<flag>.claimed`, forwards a `Reload` and
//! removes the claimed copy. A request written meanwhile lands on a fresh
//! flag file and is picked up by the next poll. Nothing is removed before
//! the reload has been handed to the worker, so a request written while the
//! daemon is down is picked up on start.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{RestartRequest, RestartSignal, SignalError};
use crate::worker::ControlMessage;

pub struct FlagFileSignal {
    path: PathBuf,
}

impl FlagFileSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RestartSignal for FlagFileSignal {
    async fn request_restart(&self, request: &RestartRequest) -> Result<(), SignalError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec_pretty(request)?;

        // write + rename so the watcher never reads a half-written file
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), request_id = %request.id, "restart requested");
        Ok(())
    }
}

/// Daemon side of [`FlagFileSignal`].
pub struct FlagFileWatcher {
    path: PathBuf,
    interval: Duration,
    control: mpsc::Sender<ControlMessage>,
    last_seen: Option<Ulid>,
}

impl FlagFileWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        control: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            path: path.into(),
            interval,
            control,
            last_seen: None,
        }
    }

    /// Check the flag file once. Returns whether a reload was forwarded.
    pub async fn poll_once(&mut self) -> Result<bool, SignalError> {
        match self.claim().await? {
            Some(claimed) => self.deliver(&claimed).await,
            None => Ok(false),
        }
    }

    fn claimed_path(&self) -> PathBuf {
        let mut claimed = self.path.clone().into_os_string();
        claimed.push(".claimed");
        PathBuf::from(claimed)
    }

    /// Move the pending request aside so a request written afterwards lands
    /// on a fresh file. A claim left over from a failed delivery is reused.
    async fn claim(&self) -> Result<Option<PathBuf>, SignalError> {
        let claimed = self.claimed_path();
        if tokio::fs::try_exists(&claimed).await? {
            return Ok(Some(claimed));
        }
        match tokio::fs::rename(&self.path, &claimed).await {
            Ok(()) => Ok(Some(claimed)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Forward a claimed request, then drop the claim. On a closed channel
    /// the claim stays for the next watcher.
    async fn deliver(&mut self, claimed: &Path) -> Result<bool, SignalError> {
        let body = match tokio::fs::read(claimed).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let request_id = match serde_json::from_slice::<RestartRequest>(&body) {
            Ok(request) => {
                info!(request_id = %request.id, command = %request.command, "restart request received");
                Some(request.id)
            }
            Err(e) => {
                // still a request, just not one we can identify
                warn!(path = %self.path.display(), error = %e, "unreadable restart request, reloading anyway");
                None
            }
        };

        let already_handled = request_id.is_some() && request_id == self.last_seen;
        if !already_handled {
            self.control
                .send(ControlMessage::Reload)
                .await
                .map_err(|_| SignalError::Closed)?;
            self.last_seen = request_id;
        }

        match tokio::fs::remove_file(claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %claimed.display(), error = %e, "could not remove claimed restart flag"),
        }
        Ok(!already_handled)
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped), or the
    /// worker goes away.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.poll_once().await {
                    Ok(_) => {}
                    Err(SignalError::Closed) => {
                        debug!("worker gone, restart flag watcher exiting");
                        break;
                    }
                    Err(e) => warn!(error = %e, "restart flag check failed"),
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        })
    }
}
