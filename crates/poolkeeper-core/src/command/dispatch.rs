use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use ulid::Ulid;

use super::{CommandArgs, CommandRegistry, CommandReport};
use crate::error::CommandError;
use crate::queue::TaskQueue;
use crate::signal::{RestartRequest, RestartSignal};

/// When a command that touches the queue asks the worker to restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Only after the mutation succeeded.
    #[default]
    OnSuccess,
    /// Also after a store failure, once the mutation was attempted.
    Always,
    /// Never; the operator restarts the daemon by hand.
    Never,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::OnSuccess => "on-success",
            RestartPolicy::Always => "always",
            RestartPolicy::Never => "never",
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [RestartPolicy::OnSuccess, RestartPolicy::Always, RestartPolicy::Never]
            .into_iter()
            .find(|policy| policy.as_str() == s)
            .ok_or_else(|| format!("unknown restart policy {s:?} (expected on-success, always or never)"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Requested(Ulid),
    /// The command cannot affect the worker (read-only), or this run left
    /// the queue unchanged.
    NotRequired,
    /// Withheld by the restart policy.
    Skipped,
    /// The signal could not be delivered.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub command: &'static str,
    pub report: CommandReport,
    pub restart: RestartOutcome,
}

/// Runs named commands against the queue and applies the restart policy.
pub struct CommandDispatcher {
    registry: CommandRegistry,
    queue: TaskQueue,
    signal: Arc<dyn RestartSignal>,
    policy: RestartPolicy,
}

impl CommandDispatcher {
    pub fn new(registry: CommandRegistry, queue: TaskQueue, signal: Arc<dyn RestartSignal>) -> Self {
        Self {
            registry,
            queue,
            signal,
            policy: RestartPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Run `name`, then send at most one restart request.
    ///
    /// A store failure is returned as the error even when the policy still
    /// sent a restart request.
    pub async fn dispatch(&self, name: &str, args: &CommandArgs) -> Result<DispatchOutcome, CommandError> {
        let runner = self
            .registry
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;

        let result = runner.run(&self.queue, args).await;

        let nothing_changed = matches!(&result, Ok(report) if !report.reload_worker);
        let restart = if !runner.restarts_worker() || nothing_changed {
            RestartOutcome::NotRequired
        } else if self.should_restart(&result) {
            self.request_restart(runner.name()).await
        } else {
            RestartOutcome::Skipped
        };

        match result {
            Ok(report) => {
                info!(command = runner.name(), affected = report.affected, "command finished");
                Ok(DispatchOutcome {
                    command: runner.name(),
                    report,
                    restart,
                })
            }
            Err(e) => {
                if let RestartOutcome::Requested(id) = restart {
                    warn!(command = runner.name(), request_id = %id, "restart requested after failed command");
                }
                Err(e)
            }
        }
    }

    fn should_restart(&self, result: &Result<CommandReport, CommandError>) -> bool {
        match (self.policy, result) {
            (RestartPolicy::Never, _) => false,
            (_, Ok(_)) => true,
            // the mutation reached the store and may have partially applied
            (RestartPolicy::Always, Err(CommandError::Store(_))) => true,
            (_, Err(_)) => false,
        }
    }

    async fn request_restart(&self, command: &str) -> RestartOutcome {
        let request = RestartRequest::new(command);
        match self.signal.request_restart(&request).await {
            Ok(()) => {
                info!(command, request_id = %request.id, "worker restart requested");
                RestartOutcome::Requested(request.id)
            }
            Err(e) => {
                error!(command, error = %e, "could not request worker restart");
                RestartOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::signal::SignalError;
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSignal {
        sent: AtomicUsize,
        broken: bool,
    }

    #[async_trait]
    impl RestartSignal for CountingSignal {
        async fn request_restart(&self, _request: &RestartRequest) -> Result<(), SignalError> {
            if self.broken {
                return Err(SignalError::Closed);
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher(store: &InMemoryTaskStore, signal: Arc<CountingSignal>, policy: RestartPolicy) -> CommandDispatcher {
        CommandDispatcher::new(
            CommandRegistry::builtin(),
            TaskQueue::new(Arc::new(store.clone())),
            signal,
        )
        .with_policy(policy)
    }

    #[rstest]
    #[case(RestartPolicy::OnSuccess, true, 1)]
    #[case(RestartPolicy::Always, true, 1)]
    #[case(RestartPolicy::Never, true, 0)]
    #[case(RestartPolicy::OnSuccess, false, 0)]
    #[case(RestartPolicy::Always, false, 1)]
    #[case(RestartPolicy::Never, false, 0)]
    #[tokio::test]
    async fn restart_policy_matrix(
        #[case] policy: RestartPolicy,
        #[case] store_up: bool,
        #[case] expected_restarts: usize,
    ) {
        let store = InMemoryTaskStore::new();
        store.set_available(store_up);
        let signal = Arc::new(CountingSignal::default());
        let dispatcher = dispatcher(&store, signal.clone(), policy);

        let result = dispatcher.dispatch("cancel-balance", &CommandArgs::none()).await;

        assert_eq!(result.is_ok(), store_up);
        if !store_up {
            assert!(matches!(result, Err(CommandError::Store(StoreError::Unavailable(_)))));
        }
        assert_eq!(signal.sent.load(Ordering::SeqCst), expected_restarts);
    }

    #[tokio::test]
    async fn read_only_command_never_restarts() {
        let store = InMemoryTaskStore::new();
        let signal = Arc::new(CountingSignal::default());
        let outcome = dispatcher(&store, signal.clone(), RestartPolicy::Always)
            .dispatch("view-queue", &CommandArgs::none())
            .await
            .unwrap();
        assert_eq!(outcome.restart, RestartOutcome::NotRequired);
        assert_eq!(signal.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_schedule_does_not_restart() {
        let store = InMemoryTaskStore::new();
        let signal = Arc::new(CountingSignal::default());
        let dispatcher = CommandDispatcher::new(
            CommandRegistry::builtin(),
            TaskQueue::new(Arc::new(store.clone()))
                .with_catalog(crate::queue::ActionCatalog::with_idempotent(["balance"])),
            signal.clone(),
        );

        let first = dispatcher.dispatch("balance", &CommandArgs::none()).await.unwrap();
        assert!(matches!(first.restart, RestartOutcome::Requested(_)));

        let again = dispatcher.dispatch("balance", &CommandArgs::none()).await.unwrap();
        assert_eq!(again.report.affected, 0);
        assert!(!again.report.reload_worker);
        assert_eq!(again.restart, RestartOutcome::NotRequired);
        assert_eq!(signal.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_arguments_do_not_restart_even_with_always() {
        let store = InMemoryTaskStore::new();
        let signal = Arc::new(CountingSignal::default());
        let err = dispatcher(&store, signal.clone(), RestartPolicy::Always)
            .dispatch("check", &CommandArgs::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument { .. }));
        assert_eq!(signal.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let store = InMemoryTaskStore::new();
        let signal = Arc::new(CountingSignal::default());
        let err = dispatcher(&store, signal, RestartPolicy::OnSuccess)
            .dispatch("defrag", &CommandArgs::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(name) if name == "defrag"));
    }

    #[tokio::test]
    async fn undeliverable_restart_is_reported_not_fatal() {
        let store = InMemoryTaskStore::new();
        let signal = Arc::new(CountingSignal {
            broken: true,
            ..CountingSignal::default()
        });
        let outcome = dispatcher(&store, signal, RestartPolicy::OnSuccess)
            .dispatch("cancel-check", &CommandArgs::none())
            .await
            .unwrap();
        assert!(matches!(outcome.restart, RestartOutcome::Failed(_)));
        assert_eq!(outcome.report.affected, 0);
    }

    #[test]
    fn policy_parses_from_cli_text() {
        assert_eq!("on-success".parse::<RestartPolicy>().unwrap(), RestartPolicy::OnSuccess);
        assert_eq!("never".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }
}
