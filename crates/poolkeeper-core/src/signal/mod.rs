//! Restart signal: how a one-shot command asks the daemon to pick up a
//! queue change.
//!
//! - `FlagFileSignal` + `FlagFileWatcher`: narrow reload across processes.
//! - `ServiceCommandSignal`: full service restart through the supervisor.
//! - `ChannelSignal`: in-process delivery straight onto the control channel.
//! - `NoopSignal`: nothing listens.

mod flag_file;
mod service;

pub use flag_file::{FlagFileSignal, FlagFileWatcher};
pub use service::ServiceCommandSignal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::worker::ControlMessage;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("restart signal i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("restart request encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("`{program}` exited with {status}")]
    CommandFailed { program: String, status: String },

    #[error("worker control channel closed")]
    Closed,
}

/// One restart request. The id lets the receiving side tell a new request
/// from one it has already acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartRequest {
    pub id: Ulid,
    pub command: String,
    pub requested_at: DateTime<Utc>,
}

impl RestartRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            command: command.into(),
            requested_at: Utc::now(),
        }
    }
}

/// Fire-and-forget delivery of a restart request to the worker side.
#[async_trait]
pub trait RestartSignal: Send + Sync {
    async fn request_restart(&self, request: &RestartRequest) -> Result<(), SignalError>;
}

pub struct ChannelSignal {
    tx: mpsc::Sender<ControlMessage>,
}

impl ChannelSignal {
    pub fn new(tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RestartSignal for ChannelSignal {
    async fn request_restart(&self, _request: &RestartRequest) -> Result<(), SignalError> {
        self.tx
            .send(ControlMessage::Reload)
            .await
            .map_err(|_| SignalError::Closed)
    }
}

pub struct NoopSignal;

#[async_trait]
impl RestartSignal for NoopSignal {
    async fn request_restart(&self, _request: &RestartRequest) -> Result<(), SignalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_signal_sends_reload() {
        let (tx, mut rx) = mpsc::channel(4);
        let signal = ChannelSignal::new(tx);
        signal
            .request_restart(&RestartRequest::new("cancel-balance"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ControlMessage::Reload));
    }

    #[tokio::test]
    async fn channel_signal_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = ChannelSignal::new(tx)
            .request_restart(&RestartRequest::new("balance"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Closed));
    }

    #[test]
    fn requests_get_distinct_ids() {
        let a = RestartRequest::new("balance");
        let b = RestartRequest::new("balance");
        assert_ne!(a.id, b.id);
    }
}
