#![deny(unused_crate_dependencies)]
#![deny(unused_must_use)]

// Used by the integration tests only.
#[cfg(test)]
use hex as _;
#[cfg(test)]
use near_crypto as _;

pub mod chains;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod health;
pub mod policies;
pub mod ports;
pub mod supervisor;

pub use config::{Config, LiveParams};
pub use coordinator::{check_timelock_pair, Coordinator, CoordinatorConfig};
pub use executor::{spawn_executor, ExecutorConfig, ExecutorHandle, JobHandler, Work, WorkKind};
pub use health::Health;
pub use policies::Policies;
pub use supervisor::{dry_run, Supervisor, SupervisorConfig};
