//! Daemon / CLI configuration, read from a TOML file.
//!
//! Every field has a default, so an absent file is a valid configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::RestartPolicy;
use crate::queue::{ActionCatalog, RetryPolicy, TaskQueue};
use crate::signal::{FlagFileSignal, RestartSignal, ServiceCommandSignal};
use crate::store::TaskStore;
use crate::worker::{SettingsSource, WorkerSettings};

pub const DEFAULT_DATABASE: &str = "/var/lib/poolkeeper/tasks.sqlite";
pub const DEFAULT_FLAG_FILE: &str = "/run/poolkeeper/restart.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// How a command reaches the running daemon after mutating the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RestartConfig {
    /// Ask the daemon to reload through a flag file it watches.
    FlagFile { flag_file: PathBuf },
    /// Restart the whole service, e.g. `systemctl restart poolkeeper`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig::FlagFile {
            flag_file: PathBuf::from(DEFAULT_FLAG_FILE),
        }
    }
}

impl RestartConfig {
    pub fn signal(&self) -> Arc<dyn RestartSignal> {
        match self {
            RestartConfig::FlagFile { flag_file } => Arc::new(FlagFileSignal::new(flag_file)),
            RestartConfig::Command { program, args } => {
                Arc::new(ServiceCommandSignal::new(program.clone(), args.clone()))
            }
        }
    }

    pub fn flag_file(&self) -> Option<&Path> {
        match self {
            RestartConfig::FlagFile { flag_file } => Some(flag_file),
            RestartConfig::Command { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolkeeperConfig {
    pub database: PathBuf,
    pub restart_policy: RestartPolicy,

    /// Actions that never have two identical pending tasks.
    pub idempotent_actions: Vec<String>,

    pub restart: RestartConfig,
    pub worker: WorkerSettings,
    pub retry: RetryPolicy,
}

impl Default for PoolkeeperConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            restart_policy: RestartPolicy::default(),
            idempotent_actions: vec!["balance".to_string(), "check".to_string()],
            restart: RestartConfig::default(),
            worker: WorkerSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolkeeperConfig {
    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn catalog(&self) -> ActionCatalog {
        ActionCatalog::from(self.idempotent_actions.clone())
    }

    pub fn queue(&self, store: Arc<dyn TaskStore>) -> TaskQueue {
        TaskQueue::new(store)
            .with_catalog(self.catalog())
            .with_retry_policy(self.retry.clone())
    }

    /// Re-read the worker section of `path` on every call (used on reload).
    pub fn worker_settings_source(path: PathBuf) -> SettingsSource {
        Arc::new(move || Self::load(&path).map(|config| config.worker))
    }
}
