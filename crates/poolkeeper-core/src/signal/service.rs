//! Full service restart through the process supervisor. Used when the
//! deployment cannot deliver a reload (no shared flag file).

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{RestartRequest, RestartSignal, SignalError};

pub struct ServiceCommandSignal {
    program: String,
    args: Vec<String>,
}

impl ServiceCommandSignal {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RestartSignal for ServiceCommandSignal {
    async fn request_restart(&self, request: &RestartRequest) -> Result<(), SignalError> {
        info!(program = %self.program, request_id = %request.id, "restarting service");
        let status = Command::new(&self.program)
            .args(&self.args)
            .env("POOLKEEPER_RESTART_REQUEST", request.id.to_string())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(SignalError::CommandFailed {
                program: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_exit_is_success() {
        let signal = ServiceCommandSignal::new("true", vec![]);
        signal
            .request_restart(&RestartRequest::new("balance"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let signal = ServiceCommandSignal::new("sh", vec!["-c".into(), "exit 3".into()]);
        let err = signal
            .request_restart(&RestartRequest::new("balance"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let signal = ServiceCommandSignal::new("/nonexistent/poolkeeper-restart", vec![]);
        let err = signal
            .request_restart(&RestartRequest::new("balance"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Io(_)));
    }
}
