use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EnvironmentArg {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevelArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevelArg::Error => "error",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Info => "info",
            LogLevelArg::Debug => "debug",
        }
    }
}

/// Cross-chain atomic-swap relayer.
#[derive(Debug, Parser)]
#[command(name = "relayer", version)]
pub struct Command {
    /// Path to the JSON configuration file.
    #[arg(long = "config", default_value = "relayer.config.json", env = "RELAYER_CONFIG")]
    pub config: PathBuf,

    /// Deployment environment; must match the configuration file.
    #[arg(long = "env", value_enum, env = "RELAYER_ENV")]
    pub environment: Option<EnvironmentArg>,

    /// Log level override (also reloadable through the config watcher).
    #[arg(long = "log-level", value_enum)]
    pub log_level: Option<LogLevelArg>,

    /// Storage directory override.
    #[arg(long = "storage-dir")]
    pub storage_dir: Option<String>,

    /// Validate configuration and connectivity, submit nothing, exit.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// How long to wait for in-flight work on shutdown.
    #[arg(long = "shutdown-timeout", default_value = "30s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,

    /// Watch the config file and apply safe changes without a restart.
    #[arg(long = "watch-config")]
    pub watch_config: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Reset a failed swap to its nearest safe prior state and re-enqueue
    /// it on the next start.
    Resume {
        /// The swap's message id.
        message_id: String,
    },
}
