//! Polls finalized Ethereum blocks, decodes bridge/factory logs, commits new
//! swaps to the store, and hands work to the executor. The cursor only moves
//! once every event in the page has been committed.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use ethers_core::types::{Address, Log, H256};
use relayer_services::{retry_with_policy, RetryPolicy, RunnableService, StateWatcher};
use relayer_storage::{StoreHandle, StoreError};
use relayer_types::{
    Chain,
    ChainEvent,
    Direction,
    EscrowRef,
    EventMeta,
    MessageId,
    RelayerError,
    Swap,
    SwapStatus,
    WorkItem,
};
use tokio::sync::{mpsc, watch};

use crate::{
    adapter::EthAdapter,
    log::{decode_log, DecodedEthLog},
    ports::EthNode,
    sync::{finalized_height, SyncGap},
};

#[derive(Debug, Clone)]
pub struct EthListenerConfig {
    pub bridge: Address,
    pub factory: Address,
    pub block_confirmations: u64,
    pub poll_interval: Duration,
    pub max_blocks_per_tick: u64,
    /// Height the bridge contract was deployed at; scanning never starts
    /// below it.
    pub start_height: u64,
    pub max_reconnect_attempts: u32,
    pub rpc_retry: RetryPolicy,
}

impl Default for EthListenerConfig {
    fn default() -> Self {
        Self {
            bridge: Address::zero(),
            factory: Address::zero(),
            block_confirmations: 12,
            poll_interval: Duration::from_secs(5),
            max_blocks_per_tick: 100,
            start_height: 0,
            max_reconnect_attempts: 5,
            rpc_retry: RetryPolicy::default(),
        }
    }
}

enum Tick {
    Continue,
    /// The executor side of the channel is gone; shut down quietly.
    Stop,
}

pub struct EthListener<N> {
    adapter: Arc<EthAdapter<N>>,
    store: StoreHandle,
    work: mpsc::Sender<WorkItem>,
    config: EthListenerConfig,
    cursor: Option<u64>,
    cursor_tx: watch::Sender<Option<u64>>,
    cursor_rx: watch::Receiver<Option<u64>>,
    /// Live poll interval in ms; a safe config reload updates it without a
    /// restart. Falls back to the static config value when absent.
    poll_ms: Option<watch::Receiver<u64>>,
    consecutive_failures: u32,
}

impl<N: EthNode> EthListener<N> {
    pub fn new(
        adapter: Arc<EthAdapter<N>>,
        store: StoreHandle,
        work: mpsc::Sender<WorkItem>,
        config: EthListenerConfig,
    ) -> Self {
        let (cursor_tx, cursor_rx) = watch::channel(None);
        Self {
            adapter,
            store,
            work,
            config,
            cursor: None,
            cursor_tx,
            cursor_rx,
            poll_ms: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_live_poll_interval(mut self, poll_ms: watch::Receiver<u64>) -> Self {
        self.poll_ms = Some(poll_ms);
        self
    }

    fn poll_interval(&self) -> Duration {
        self.poll_ms
            .as_ref()
            .map(|rx| Duration::from_millis(*rx.borrow()))
            .unwrap_or(self.config.poll_interval)
    }

    async fn rpc<T, Fut>(&self, op: impl FnMut() -> Fut) -> Result<T, RelayerError>
    where
        Fut: std::future::Future<Output = Result<T, RelayerError>>,
    {
        retry_with_policy(&self.config.rpc_retry, |e: &RelayerError, _| e.is_retryable(), op).await
    }

    async fn tick(&mut self) -> Result<Tick, RelayerError> {
        let adapter = self.adapter.clone();
        let head = self.rpc(|| {
            let adapter = adapter.clone();
            async move { adapter.get_block_number().await }
        })
        .await?;
        let finalized = finalized_height(head, self.config.block_confirmations);

        let Some(gap) = SyncGap::new(self.cursor, finalized, self.config.start_height) else {
            return Ok(Tick::Continue);
        };
        tracing::debug!(oldest = gap.oldest(), latest = gap.latest(), "syncing finalized blocks");

        let mut page = gap.page(self.config.max_blocks_per_tick);
        while let Some(window) = page {
            let adapter = self.adapter.clone();
            let (from, to) = (window.oldest(), window.latest());
            let addresses = vec![self.config.bridge, self.config.factory];
            let logs = self
                .rpc(|| {
                    let adapter = adapter.clone();
                    let addresses = addresses.clone();
                    async move { adapter.get_logs(addresses, from, to).await }
                })
                .await?;

            for log in &logs {
                if let Tick::Stop = self.handle_log(log).await? {
                    return Ok(Tick::Stop);
                }
            }

            self.store.advance_cursor(Chain::Ethereum, to).await?;
            self.cursor = Some(to);
            let _ = self.cursor_tx.send(self.cursor);
            page = window.reduce();
        }
        Ok(Tick::Continue)
    }

    async fn handle_log(&mut self, log: &Log) -> Result<Tick, RelayerError> {
        // Decode failure on a known topic is unrecoverable for this worker.
        let Some(decoded) = decode_log(log)? else {
            return Ok(Tick::Continue);
        };

        let (tx_hash, log_index, block) = match (log.transaction_hash, log.log_index, log.block_number)
        {
            (Some(hash), Some(index), Some(block)) => (hash, index.as_u64(), block.as_u64()),
            _ => {
                return Err(RelayerError::validation(
                    "eth_log",
                    "finalized log without tx hash, index or block number",
                ))
            }
        };
        let event_id = MessageId::from_eth(tx_hash, log_index);
        let meta = EventMeta {
            message_id: event_id.clone(),
            chain: Chain::Ethereum,
            block,
            tx_hash: format!("{tx_hash:#x}"),
        };

        match decoded {
            DecodedEthLog::DepositInitiated {
                deposit_id,
                sender,
                near_recipient,
                token,
                amount,
                fee,
                timestamp,
            } => {
                if self.store.is_processed(&event_id).await? {
                    tracing::debug!(message_id = %event_id, "deposit already processed");
                    return Ok(Tick::Continue);
                }

                // The wire event does not carry the hashlock or the deadline.
                let adapter = self.adapter.clone();
                let deposit = self
                    .rpc(|| {
                        let adapter = adapter.clone();
                        async move { adapter.get_deposit(deposit_id).await }
                    })
                    .await?;
                let (secret_hash, timelock) = (deposit.hashlock, deposit.timelock);

                let event = ChainEvent::EthDepositInitiated {
                    meta,
                    deposit_id,
                    sender,
                    near_recipient: near_recipient.clone(),
                    token,
                    amount,
                    fee,
                    timestamp,
                    secret_hash,
                    timelock,
                };
                let swap = self.swap_from_deposit(&event_id, &event)?;
                match self.store.begin(swap).await {
                    Ok(()) => {}
                    Err(StoreError::AlreadyExists(id)) => {
                        tracing::debug!(message_id = %id, "duplicate deposit event discarded");
                        return Ok(Tick::Continue);
                    }
                    Err(e) => return Err(e.into()),
                }
                self.forward(event_id, event).await
            }
            DecodedEthLog::WithdrawalCompleted {
                deposit_id,
                recipient,
                amount,
                timestamp,
            } => {
                let Some(swap) = self.correlate_deposit_id(deposit_id).await? else {
                    tracing::debug!(deposit_id = %deposit_id, "withdrawal for unknown deposit");
                    return Ok(Tick::Continue);
                };
                if swap.status.is_terminal() {
                    return Ok(Tick::Continue);
                }

                let adapter = self.adapter.clone();
                let secret = match self
                    .rpc(|| {
                        let adapter = adapter.clone();
                        async move { adapter.get_revealed_secret(deposit_id).await }
                    })
                    .await
                {
                    Ok(secret) => secret,
                    Err(e) if !e.is_retryable() => {
                        // Without the preimage there is nothing to propagate;
                        // the timelock path still protects the funds.
                        tracing::warn!(deposit_id = %deposit_id, error = %e, "revealed secret unavailable");
                        return Ok(Tick::Continue);
                    }
                    Err(e) => return Err(e),
                };

                let event = ChainEvent::EthWithdrawalCompleted {
                    meta,
                    deposit_id,
                    recipient,
                    amount,
                    timestamp,
                    secret,
                };
                self.forward(swap.message_id, event).await
            }
            DecodedEthLog::MessageSent { deposit_id, .. } => {
                tracing::debug!(deposit_id = %deposit_id, "bridge message observed");
                Ok(Tick::Continue)
            }
            DecodedEthLog::EscrowCreated { escrow, initiator, .. } => {
                // Our own factory submissions surface here as well; the
                // escrow address was already recorded from the receipt.
                if initiator == self.adapter.signer_address() {
                    tracing::debug!(escrow = %escrow, "observed our own escrow creation");
                } else {
                    tracing::debug!(escrow = %escrow, "unrelated escrow creation ignored");
                }
                Ok(Tick::Continue)
            }
        }
    }

    /// A `WithdrawalCompleted` deposit id is either a bridge deposit (our
    /// ETH→NEAR source) or a factory escrow id (our NEAR→ETH mirror).
    async fn correlate_deposit_id(&self, deposit_id: H256) -> Result<Option<Swap>, RelayerError> {
        let as_deposit = EscrowRef::Eth(format!("{deposit_id:#x}"));
        if let Some(swap) = self.store.find_by_ref(&as_deposit).await? {
            return Ok(Some(swap));
        }
        let address = Address::from_slice(&deposit_id.as_bytes()[12..]);
        let as_escrow = EscrowRef::Eth(format!("{address:#x}"));
        Ok(self.store.find_by_ref(&as_escrow).await?)
    }

    fn swap_from_deposit(
        &self,
        event_id: &MessageId,
        event: &ChainEvent,
    ) -> Result<Swap, RelayerError> {
        let ChainEvent::EthDepositInitiated {
            deposit_id,
            sender,
            near_recipient,
            amount,
            secret_hash,
            timelock,
            ..
        } = event
        else {
            return Err(RelayerError::validation("event", "not a deposit"));
        };
        let amount_source = relayer_types::Amount::Wei(*amount);
        let now = Utc::now();
        Ok(Swap {
            message_id: event_id.clone(),
            direction: Direction::EthToNear,
            secret_hash: *secret_hash,
            secret: None,
            amount_dest: amount_source.mirrored()?,
            amount_source,
            initiator: format!("{sender:#x}"),
            recipient: near_recipient.clone(),
            timelock_source: *timelock,
            // Fixed by the coordinator's validate step; recorded here so the
            // record is complete from the first write.
            timelock_dest: 0,
            status: SwapStatus::Observed,
            source_ref: Some(EscrowRef::Eth(format!("{deposit_id:#x}"))),
            escrow_ref: None,
            attempts: Default::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn forward(&self, key: MessageId, event: ChainEvent) -> Result<Tick, RelayerError> {
        if self.work.send(WorkItem { key, event }).await.is_err() {
            return Ok(Tick::Stop);
        }
        Ok(Tick::Continue)
    }
}

#[async_trait::async_trait]
impl<N: EthNode + 'static> RunnableService for EthListener<N> {
    const NAME: &'static str = "eth-listener";

    type SharedData = watch::Receiver<Option<u64>>;

    fn shared_data(&self) -> Self::SharedData {
        self.cursor_rx.clone()
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.cursor = self.store.cursor(Chain::Ethereum).await?;
        let _ = self.cursor_tx.send(self.cursor);
        Ok(())
    }

    async fn run(&mut self, watcher: &mut StateWatcher) -> anyhow::Result<bool> {
        match self.tick().await {
            Ok(Tick::Stop) => return Ok(false),
            Ok(Tick::Continue) => {
                self.consecutive_failures = 0;
                sleep_or_stop(self.poll_interval(), watcher).await;
            }
            Err(e) if e.is_retryable() => {
                self.consecutive_failures += 1;
                if self.consecutive_failures > self.config.max_reconnect_attempts {
                    return Err(anyhow::anyhow!(
                        "ethereum provider unreachable after {} reconnect attempts: {e}",
                        self.config.max_reconnect_attempts
                    ));
                }
                let backoff = reconnect_backoff(self.consecutive_failures);
                tracing::warn!(
                    error = %e,
                    attempt = self.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    "ethereum provider error, backing off"
                );
                sleep_or_stop(backoff, watcher).await;
            }
            // Decode or storage failures are fatal for this worker.
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Outer reconnection backoff: exponential from 1s, capped at 30s.
fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.saturating_sub(1).min(5);
    Duration::from_secs(secs.min(30))
}

async fn sleep_or_stop(duration: Duration, watcher: &mut StateWatcher) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = watcher.changed() => {}
    }
}
