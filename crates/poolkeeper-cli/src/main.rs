mod daemon;
mod handlers;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use poolkeeper_core::command::{CommandArgs, RestartOutcome};
use poolkeeper_core::config::{ConfigError, PoolkeeperConfig};
use poolkeeper_core::store::SqliteTaskStore;
use poolkeeper_core::{CommandDispatcher, CommandError, CommandRegistry, RestartPolicy};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "/etc/poolkeeper/poolkeeper.toml";

#[derive(Parser)]
#[command(name = "poolkeeper")]
#[command(about = "Task queue and maintenance worker for pooled storage", long_about = None)]
struct Cli {
    /// TOML configuration file (missing file means defaults).
    #[arg(long, global = true, env = "POOLKEEPER_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Task database, overrides `database` from the config file.
    #[arg(long, global = true, env = "POOLKEEPER_DATABASE")]
    database: Option<PathBuf>,

    /// When to ask the daemon to reload after a command: on-success, always, never.
    #[arg(long, global = true)]
    restart_policy: Option<RestartPolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the worker and wait for reload requests")]
    Daemon,
    #[command(about = "Cancel all pending balance tasks")]
    CancelBalance,
    #[command(about = "Cancel all pending check tasks")]
    CancelCheck,
    #[command(about = "Schedule a balance pass")]
    Balance,
    #[command(about = "Schedule a consistency check of a path")]
    Check {
        #[arg(value_name = "PATH")]
        path: String,
    },
    #[command(about = "Show task counts per action and status")]
    ViewQueue,
}

impl Commands {
    /// Registry name and arguments for the one-shot commands.
    fn dispatch_args(&self) -> Option<(&'static str, CommandArgs)> {
        match self {
            Commands::Daemon => None,
            Commands::CancelBalance => Some(("cancel-balance", CommandArgs::none())),
            Commands::CancelCheck => Some(("cancel-check", CommandArgs::none())),
            Commands::Balance => Some(("balance", CommandArgs::none())),
            Commands::Check { path } => Some(("check", CommandArgs::with_path(path.clone()))),
            Commands::ViewQueue => Some(("view-queue", CommandArgs::none())),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = PoolkeeperConfig::load(&cli.config)?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    if let Some(policy) = cli.restart_policy {
        config.restart_policy = policy;
    }

    let store = SqliteTaskStore::open(&config.database)
        .with_context(|| format!("opening task database {}", config.database.display()))?;
    let store = Arc::new(store);

    let Some((name, args)) = cli.command.dispatch_args() else {
        return daemon::run(config, cli.config, store).await;
    };

    let dispatcher = CommandDispatcher::new(
        CommandRegistry::builtin(),
        config.queue(store),
        config.restart.signal(),
    )
    .with_policy(config.restart_policy);

    let outcome = dispatcher.dispatch(name, &args).await?;
    println!("{}", outcome.report.message);
    if let RestartOutcome::Failed(reason) = &outcome.restart {
        warn!(%reason, "the daemon was not notified; restart it to pick up the change");
    }
    Ok(())
}

/// 2 for configuration and usage problems, 1 for everything else
/// (store failures in particular).
fn exit_code(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    match e.downcast_ref::<CommandError>() {
        Some(CommandError::InvalidArgument { .. } | CommandError::UnknownCommand(_)) => 2,
        _ => 1,
    }
}
