#![deny(unused_must_use)]

mod cli;

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use relayer_engine::{dry_run, Config, Supervisor, SupervisorConfig};
use relayer_eth::JsonRpcEthNode;
use relayer_near::JsonRpcNearNode;
use relayer_types::MessageId;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use crate::cli::{Action, Command, EnvironmentArg};

const EXIT_OK: u8 = 0;
const EXIT_UNHANDLED: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_ENVIRONMENT: u8 = 3;
const EXIT_SIGINT: u8 = 130;

const RPC_TIMEOUT: Duration = Duration::from_secs(15);

fn main() -> ExitCode {
    let command = Command::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start the runtime: {e}");
            return ExitCode::from(EXIT_UNHANDLED);
        }
    };
    let code = runtime.block_on(run(command));
    ExitCode::from(code)
}

fn init_logging(level: &str) -> tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    handle
}

async fn run(command: Command) -> u8 {
    // Load and validate configuration first; logging comes up with the
    // effective level.
    let mut config = match Config::load(&command.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return EXIT_INVALID_CONFIG;
        }
    };
    if let Some(storage_dir) = &command.storage_dir {
        config.relayer.storage_dir = storage_dir.clone();
    }
    if let Some(level) = command.log_level {
        config.relayer.log_level = level.as_str().to_string();
    }
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return EXIT_INVALID_CONFIG;
    }
    if let Some(environment) = command.environment {
        let matches = matches!(
            (environment, config.environment),
            (EnvironmentArg::Development, relayer_engine::config::Environment::Development)
                | (EnvironmentArg::Staging, relayer_engine::config::Environment::Staging)
                | (EnvironmentArg::Production, relayer_engine::config::Environment::Production)
        );
        if !matches {
            eprintln!(
                "--env {environment:?} does not match the configured environment {:?}",
                config.environment
            );
            return EXIT_ENVIRONMENT;
        }
    }

    let reload_handle = init_logging(&config.relayer.log_level);

    if let Some(Action::Resume { message_id }) = &command.action {
        return resume(&config, message_id).await;
    }

    let eth_node = match JsonRpcEthNode::connect(&config.ethereum.network.rpc_url, RPC_TIMEOUT) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "cannot reach the ethereum endpoint");
            return EXIT_ENVIRONMENT;
        }
    };
    let near_node = match JsonRpcNearNode::connect(&config.near.node_url, RPC_TIMEOUT) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "cannot reach the near endpoint");
            return EXIT_ENVIRONMENT;
        }
    };

    if command.dry_run {
        return match dry_run(&config, &eth_node, &near_node).await {
            Ok(()) => {
                tracing::info!("dry run passed: configuration and connectivity are valid");
                EXIT_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "dry run failed");
                EXIT_ENVIRONMENT
            }
        };
    }

    let supervisor_config = SupervisorConfig {
        project_root: std::env::current_dir().unwrap_or_else(|_| ".".into()),
        shutdown_timeout: command.shutdown_timeout,
        watch_config_path: command.watch_config.then(|| command.config.clone()),
    };

    let supervisor =
        match Supervisor::start(config, supervisor_config, eth_node, near_node).await {
            Ok(supervisor) => supervisor,
            Err(e) => {
                tracing::error!(error = %e, "failed to start the relayer");
                return EXIT_UNHANDLED;
            }
        };

    // Safe log-level reloads flow from the supervisor's config watcher.
    let mut log_level = supervisor.log_level_watch();
    let reload_task = tokio::spawn(async move {
        while log_level.changed().await.is_ok() {
            let level = log_level.borrow().clone();
            let _ = reload_handle.modify(|filter| *filter = EnvFilter::new(&level));
            tracing::info!(%level, "log level updated");
        }
    });

    tracing::info!("relayer started");
    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            EXIT_SIGINT
        }
        failed = supervisor.run_until_failure() => {
            match failed {
                Some(chain) => {
                    tracing::error!(%chain, "chain worker stopped; shutting down");
                    EXIT_UNHANDLED
                }
                None => EXIT_OK,
            }
        }
    };

    reload_task.abort();
    if let Err(e) = supervisor.shutdown().await {
        tracing::error!(error = %e, "shutdown failed");
        return EXIT_UNHANDLED;
    }
    code
}

/// `relayer resume <message_id>`: operator action against the persisted
/// store, no chain connectivity required.
async fn resume(config: &Config, raw_id: &str) -> u8 {
    let message_id = match MessageId::parse(raw_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "invalid message id");
            return EXIT_INVALID_CONFIG;
        }
    };

    let project_root = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let storage_dir = match relayer_storage::resolve_storage_dir(
        &project_root,
        &config.relayer.storage_dir,
    ) {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "invalid storage directory");
            return EXIT_INVALID_CONFIG;
        }
    };
    let store = match relayer_storage::spawn_store(&storage_dir) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "cannot open the store");
            return EXIT_UNHANDLED;
        }
    };

    match store.resume(&message_id).await {
        Ok(swap) => {
            tracing::info!(
                message_id = %swap.message_id,
                status = %swap.status,
                "swap reset; it will be re-enqueued on the next start"
            );
            let _ = store.flush().await;
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "resume failed");
            EXIT_UNHANDLED
        }
    }
}
