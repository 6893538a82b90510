//! Process lifecycle: owns the store task, both chain adapters, both
//! listeners and the executor. Boot reconciles persisted swaps, shutdown
//! drains in order (listeners first, then the executor, then a final store
//! flush), and an optional config watcher applies safe changes to the
//! running services.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use ethers_core::types::{Address, U256};
use relayer_eth::{EthAdapter, EthAdapterConfig, EthListener, EthListenerConfig, EthNode};
use relayer_near::{NearAdapter, NearAdapterConfig, NearListener, NearListenerConfig, NearRpc};
use relayer_services::{RetryPolicy, Service, ServiceRunner};
use relayer_storage::{resolve_storage_dir, spawn_store, StoreHandle};
use relayer_types::{Chain, RelayerError, SwapStatus, WorkItem};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::{Config, LiveParams},
    coordinator::{Coordinator, CoordinatorConfig},
    executor::{spawn_executor, ExecutorConfig, ExecutorHandle, Work, WorkKind},
    health::Health,
    policies::Policies,
};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root the storage directory is resolved against.
    pub project_root: PathBuf,
    pub shutdown_timeout: Duration,
    /// Watch this file for safe config changes (1 s granularity).
    pub watch_config_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            shutdown_timeout: Duration::from_secs(30),
            watch_config_path: None,
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Supervisor<NE: EthNode + 'static, NR: NearRpc + 'static> {
    store: StoreHandle,
    eth_listener: ServiceRunner<EthListener<NE>>,
    near_listener: ServiceRunner<NearListener<NR>>,
    executor: Option<ExecutorHandle>,
    sweep: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    watcher: Option<JoinHandle<()>>,
    health_logger: Option<JoinHandle<()>>,
    log_level: watch::Receiver<String>,
    shutdown_timeout: Duration,
}

impl<NE: EthNode + 'static, NR: NearRpc + 'static> Supervisor<NE, NR> {
    /// Wire everything up and start both workers. `eth_node` and `near_rpc`
    /// are injected so tests can drive the whole pipeline against scripted
    /// nodes.
    pub async fn start(
        config: Config,
        supervisor_config: SupervisorConfig,
        eth_node: NE,
        near_rpc: NR,
    ) -> anyhow::Result<Self> {
        let storage_dir =
            resolve_storage_dir(&supervisor_config.project_root, &config.relayer.storage_dir)?;
        std::fs::create_dir_all(&storage_dir)
            .with_context(|| format!("creating storage dir {}", storage_dir.display()))?;
        let store = spawn_store(&storage_dir)?;

        // Live parameters: published once here, then again on each safe
        // reload.
        let live = config.live_params();
        let (poll_tx, poll_rx) = watch::channel(live.polling_interval_ms);
        let (policies_tx, policies_rx) = watch::channel(live.policies.clone());
        let (limit_tx, limit_rx) = watch::channel(live.concurrency_limit);
        let (log_level_tx, log_level_rx) = watch::channel(live.log_level.clone());

        let eth_adapter = Arc::new(build_eth_adapter(eth_node, &config)?);
        let near_adapter = Arc::new(build_near_adapter(near_rpc, &config)?);

        let (item_tx, mut item_rx) = mpsc::channel::<WorkItem>(256);
        let (work_tx, work_rx) = mpsc::channel::<Work>(256);

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            eth_adapter.clone(),
            near_adapter.clone(),
            CoordinatorConfig {
                safety_margin_secs: config.relayer.safety_margin_secs,
                min_headroom_secs: config.relayer.min_timelock_headroom_secs,
                refund_grace_secs: config.relayer.refund_grace_secs,
            },
            policies_rx,
        ));
        let executor = spawn_executor(
            work_rx,
            coordinator,
            ExecutorConfig {
                concurrency_limit: limit_rx,
            },
        );

        // Re-post every non-terminal swap before any listener produces new
        // work; expired swaps head straight into the refund path.
        let persisted = store.all().await?;
        for swap in persisted.iter().filter(|swap| !swap.status.is_terminal()) {
            work_tx
                .send(Work {
                    key: swap.message_id.clone(),
                    kind: WorkKind::RefundSweep,
                })
                .await
                .ok();
        }
        if !persisted.is_empty() {
            tracing::info!(
                total = persisted.len(),
                reconciled = persisted.iter().filter(|s| !s.status.is_terminal()).count(),
                "boot reconciliation queued"
            );
        }

        let forwarder = {
            let work_tx = work_tx.clone();
            tokio::spawn(async move {
                while let Some(item) = item_rx.recv().await {
                    if work_tx.send(Work::from(item)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let sweep = spawn_sweep(store.clone(), work_tx, poll_rx.clone());

        let eth_listener = ServiceRunner::new(
            EthListener::new(
                eth_adapter,
                store.clone(),
                item_tx.clone(),
                eth_listener_config(&config)?,
            )
            .with_live_poll_interval(poll_rx.clone()),
        );
        let near_listener = ServiceRunner::new(
            NearListener::new(
                near_adapter,
                store.clone(),
                item_tx,
                near_listener_config(&config),
            )
            .with_live_poll_interval(poll_rx),
        );

        if config.relayer.auto_start {
            eth_listener.start()?;
            near_listener.start()?;
        }

        let watcher = supervisor_config.watch_config_path.clone().map(|path| {
            spawn_config_watcher(
                path,
                config.clone(),
                poll_tx,
                policies_tx,
                limit_tx,
                log_level_tx,
            )
        });

        let health_logger = config.monitoring.health_check.enabled.then(|| {
            spawn_health_logger(
                store.clone(),
                eth_listener.clone(),
                near_listener.clone(),
                executor.depth_watch(),
                Duration::from_millis(config.monitoring.health_check.interval),
            )
        });

        Ok(Self {
            store,
            eth_listener,
            near_listener,
            executor: Some(executor),
            sweep,
            forwarder,
            watcher,
            health_logger,
            log_level: log_level_rx,
            shutdown_timeout: supervisor_config.shutdown_timeout,
        })
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Live log level, for the binary's reloadable tracing filter.
    pub fn log_level_watch(&self) -> watch::Receiver<String> {
        self.log_level.clone()
    }

    pub async fn health(&self) -> Health {
        Health {
            eth_listener: self.eth_listener.state(),
            near_listener: self.near_listener.state(),
            eth_cursor: *self.eth_listener.shared.borrow(),
            near_cursor: *self.near_listener.shared.borrow(),
            executor_depth: self
                .executor
                .as_ref()
                .map(ExecutorHandle::queue_depth)
                .unwrap_or(0),
            swaps: self.store.stats().await.unwrap_or_default(),
        }
    }

    /// Block until either listener dies. Returns the failed worker's name,
    /// or `None` on an external stop.
    pub async fn run_until_failure(&self) -> Option<Chain> {
        tokio::select! {
            state = self.eth_listener.await_stop() => {
                state.ok().map(|_| Chain::Ethereum)
            }
            state = self.near_listener.await_stop() => {
                state.ok().map(|_| Chain::Near)
            }
        }
    }

    /// Ordered shutdown: listeners stop producing, the executor drains until
    /// idle or the timeout fires, the store flushes its last consistent
    /// state.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        tracing::info!("shutting down: stopping listeners");
        let _ = self.eth_listener.stop_and_await().await;
        let _ = self.near_listener.stop_and_await().await;

        self.sweep.abort();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(health_logger) = self.health_logger.take() {
            health_logger.abort();
        }
        let _ = self.forwarder.await;

        if let Some(executor) = self.executor.take() {
            if !executor.drain_timeout(self.shutdown_timeout).await {
                tracing::warn!("executor did not drain before the shutdown timeout");
            }
        }

        self.store.flush().await?;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

fn build_eth_adapter<NE: EthNode>(
    node: NE,
    config: &Config,
) -> Result<EthAdapter<NE>, RelayerError> {
    let eth = &config.ethereum;
    let bridge: Address = eth
        .bridge_contract_address
        .parse()
        .map_err(|_| RelayerError::validation("ethereum.bridgeContractAddress", "not an address"))?;
    let factory: Address = eth
        .escrow_factory_address
        .as_deref()
        .unwrap_or(&eth.escrow_contract_address)
        .parse()
        .map_err(|_| RelayerError::validation("ethereum.escrowFactoryAddress", "not an address"))?;
    EthAdapter::new(
        node,
        &eth.private_key,
        EthAdapterConfig {
            bridge,
            factory,
            chain_id: eth.network.chain_id,
            receipt_confirmations: 2,
            receipt_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_secs(3),
            max_gas_price: eth.max_gas_price.map(U256::from),
        },
    )
}

fn build_near_adapter<NR: NearRpc>(
    rpc: NR,
    config: &Config,
) -> Result<NearAdapter<NR>, RelayerError> {
    NearAdapter::new(
        rpc,
        &config.near.private_key,
        NearAdapterConfig {
            network_id: config.near.network_id.clone(),
            escrow_contract: config.near.escrow_contract_id.clone(),
            account_id: config.near.account_id.clone(),
        },
    )
}

fn rpc_retry() -> RetryPolicy {
    RetryPolicy::default()
}

fn eth_listener_config(config: &Config) -> Result<EthListenerConfig, RelayerError> {
    let eth = &config.ethereum;
    Ok(EthListenerConfig {
        bridge: eth
            .bridge_contract_address
            .parse()
            .map_err(|_| RelayerError::validation("ethereum.bridgeContractAddress", "not an address"))?,
        factory: eth
            .escrow_factory_address
            .as_deref()
            .unwrap_or(&eth.escrow_contract_address)
            .parse()
            .map_err(|_| RelayerError::validation("ethereum.escrowFactoryAddress", "not an address"))?,
        block_confirmations: eth.network.block_confirmations,
        poll_interval: Duration::from_millis(config.relayer.polling_interval),
        max_blocks_per_tick: config.relayer.batch_size,
        start_height: 0,
        max_reconnect_attempts: 5,
        rpc_retry: rpc_retry(),
    })
}

fn near_listener_config(config: &Config) -> NearListenerConfig {
    NearListenerConfig {
        poll_interval: Duration::from_millis(config.relayer.polling_interval),
        max_blocks_per_tick: config.relayer.batch_size,
        start_height: 0,
        max_reconnect_attempts: 5,
        rpc_retry: rpc_retry(),
    }
}

/// Periodically re-post actionable swaps: stuck mirrors, pending
/// withdrawals, and everything whose destination deadline has passed.
fn spawn_sweep(
    store: StoreHandle,
    work_tx: mpsc::Sender<Work>,
    poll_ms: watch::Receiver<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = Duration::from_millis(*poll_ms.borrow());
            tokio::time::sleep(interval).await;

            let Ok(swaps) = store.all().await else { return };
            let now = unix_now();
            for swap in swaps {
                let due = match swap.status {
                    SwapStatus::Mirroring
                    | SwapStatus::Propagating
                    | SwapStatus::Refunding => true,
                    SwapStatus::AwaitingSettlement => now > swap.timelock_dest,
                    _ => false,
                };
                if due {
                    if work_tx
                        .send(Work {
                            key: swap.message_id.clone(),
                            kind: WorkKind::RefundSweep,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    })
}

/// Poll the config file's mtime at 1 s granularity; apply safe changes,
/// reject unsafe ones loudly.
fn spawn_config_watcher(
    path: PathBuf,
    baseline: Config,
    poll_tx: watch::Sender<u64>,
    policies_tx: watch::Sender<Policies>,
    limit_tx: watch::Sender<usize>,
    log_level_tx: watch::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        let mut applied: Option<LiveParams> = None;

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let mtime = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            if mtime == last_mtime {
                continue;
            }
            last_mtime = mtime;

            let reloaded = match Config::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "config reload rejected: file is invalid");
                    continue;
                }
            };
            match baseline.classify_reload(&reloaded) {
                Ok(live) => {
                    if applied.as_ref() == Some(&live) {
                        continue;
                    }
                    tracing::info!("applying safe configuration changes");
                    let _ = poll_tx.send(live.polling_interval_ms);
                    let _ = policies_tx.send(live.policies.clone());
                    let _ = limit_tx.send(live.concurrency_limit);
                    let _ = log_level_tx.send(live.log_level.clone());
                    applied = Some(live);
                }
                Err(e) => {
                    tracing::error!(error = %e, "config reload rejected");
                }
            }
        }
    })
}

fn spawn_health_logger<NE: EthNode + 'static, NR: NearRpc + 'static>(
    store: StoreHandle,
    eth_listener: ServiceRunner<EthListener<NE>>,
    near_listener: ServiceRunner<NearListener<NR>>,
    depth: watch::Receiver<usize>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let eth_listener_state = eth_listener.state();
            let near_listener_state = near_listener.state();
            let eth_cursor = *eth_listener.shared.borrow();
            let near_cursor = *near_listener.shared.borrow();
            let executor_depth = *depth.borrow();
            let swaps = store.stats().await.unwrap_or_default();
            let health = Health {
                eth_listener: eth_listener_state,
                near_listener: near_listener_state,
                eth_cursor,
                near_cursor,
                executor_depth,
                swaps,
            };
            if health.is_healthy() {
                tracing::info!(%health, "health check");
            } else {
                tracing::warn!(%health, "health check: degraded");
            }
        }
    })
}

/// Validate configuration and connectivity without submitting anything:
/// reachable nodes, matching chain ids, derivable signer identities.
pub async fn dry_run<NE: EthNode, NR: NearRpc>(
    config: &Config,
    eth_node: &NE,
    near_rpc: &NR,
) -> Result<(), RelayerError> {
    let chain_id = eth_node.chain_id().await?;
    if chain_id != config.ethereum.network.chain_id {
        return Err(RelayerError::validation(
            "ethereum.network.chainId",
            format!(
                "configured {} but the node reports {chain_id}",
                config.ethereum.network.chain_id
            ),
        ));
    }
    let head = eth_node.block_number().await?;
    tracing::info!(chain_id, head, "ethereum node reachable");

    let status = near_rpc.status().await?;
    if status.chain_id != config.near.network_id {
        return Err(RelayerError::validation(
            "near.networkId",
            format!(
                "configured {} but the node reports {}",
                config.near.network_id, status.chain_id
            ),
        ));
    }
    tracing::info!(
        chain_id = %status.chain_id,
        height = status.latest_height,
        "near node reachable"
    );
    Ok(())
}
