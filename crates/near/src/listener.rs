//! Polls NEAR at `finality: final`, walks block chunks for transactions
//! addressed to the escrow contract, and parses their receipt logs through
//! the escrow grammar. A missing chunk stops the tick without advancing the
//! cursor past its block.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use relayer_services::{retry_with_policy, RetryPolicy, RunnableService, StateWatcher};
use relayer_storage::{StoreError, StoreHandle};
use relayer_types::{
    Chain,
    ChainEvent,
    Direction,
    EscrowRef,
    EventMeta,
    MessageId,
    RelayerError,
    SecretHash,
    Swap,
    SwapStatus,
    WorkItem,
};
use tokio::sync::{mpsc, watch};

use crate::{
    adapter::{NearAdapter, OrderView},
    logs::{parse_escrow_log, EscrowLog},
    ports::NearRpc,
};

#[derive(Debug, Clone)]
pub struct NearListenerConfig {
    pub poll_interval: Duration,
    pub max_blocks_per_tick: u64,
    pub start_height: u64,
    pub max_reconnect_attempts: u32,
    pub rpc_retry: RetryPolicy,
}

impl Default for NearListenerConfig {
    fn default() -> Self {
        Self {
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
    Stop,
}

pub struct NearListener<R> {
    adapter: Arc<NearAdapter<R>>,
    store: StoreHandle,
    work: mpsc::Sender<WorkItem>,
    config: NearListenerConfig,
    cursor: Option<u64>,
    cursor_tx: watch::Sender<Option<u64>>,
    cursor_rx: watch::Receiver<Option<u64>>,
    /// Live poll interval in ms; a safe config reload updates it without a
    /// restart. Falls back to the static config value when absent.
    poll_ms: Option<watch::Receiver<u64>>,
    consecutive_failures: u32,
}

impl<R: NearRpc> NearListener<R> {
    pub fn new(
        adapter: Arc<NearAdapter<R>>,
        store: StoreHandle,
        work: mpsc::Sender<WorkItem>,
        config: NearListenerConfig,
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
        let head = self
            .rpc(|| {
                let adapter = adapter.clone();
                async move { adapter.rpc().block_final().await }
            })
            .await?
            .height;

        let mut next = self
            .cursor
            .map(|c| c + 1)
            .unwrap_or(self.config.start_height)
            .max(self.config.start_height);
        let tick_end =
            head.min(next.saturating_add(self.config.max_blocks_per_tick.saturating_sub(1)));

        while next <= tick_end {
            match self.process_height(next).await? {
                HeightOutcome::Done => {
                    self.store.advance_cursor(Chain::Near, next).await?;
                    self.cursor = Some(next);
                    let _ = self.cursor_tx.send(self.cursor);
                    next += 1;
                }
                HeightOutcome::ChunkMissing => {
                    // Retry this height on the next tick against the
                    // canonical block view.
                    tracing::debug!(height = next, "chunk missing, holding cursor");
                    return Ok(Tick::Continue);
                }
                HeightOutcome::Stop => return Ok(Tick::Stop),
            }
        }
        Ok(Tick::Continue)
    }

    async fn process_height(&mut self, height: u64) -> Result<HeightOutcome, RelayerError> {
        let adapter = self.adapter.clone();
        let Some(block) = self
            .rpc(|| {
                let adapter = adapter.clone();
                async move { adapter.rpc().block_at(height).await }
            })
            .await?
        else {
            // The chain skipped this height.
            return Ok(HeightOutcome::Done);
        };

        for chunk_header in &block.chunks {
            // A shard that produced nothing re-lists its previous chunk.
            if chunk_header.height_included != height {
                continue;
            }
            let adapter = self.adapter.clone();
            let chunk_hash = chunk_header.chunk_hash.clone();
            let Some(chunk) = self
                .rpc(|| {
                    let adapter = adapter.clone();
                    let chunk_hash = chunk_hash.clone();
                    async move { adapter.rpc().chunk(&chunk_hash).await }
                })
                .await?
            else {
                return Ok(HeightOutcome::ChunkMissing);
            };

            for tx in &chunk.transactions {
                if tx.receiver_id != self.adapter.escrow_contract().as_str() {
                    continue;
                }
                if let Tick::Stop = self.process_transaction(height, tx).await? {
                    return Ok(HeightOutcome::Stop);
                }
            }
        }
        Ok(HeightOutcome::Done)
    }

    async fn process_transaction(
        &mut self,
        height: u64,
        tx: &crate::ports::ChunkTransactionView,
    ) -> Result<Tick, RelayerError> {
        let adapter = self.adapter.clone();
        let (tx_hash, signer) = (tx.hash.clone(), tx.signer_id.clone());
        let outcome = self
            .rpc(|| {
                let adapter = adapter.clone();
                let (tx_hash, signer) = (tx_hash.clone(), signer.clone());
                async move { adapter.rpc().tx_status(&tx_hash, &signer).await }
            })
            .await?;

        for (receipt_index, receipt) in outcome.receipts.iter().enumerate() {
            for line in &receipt.logs {
                let Some(log) = parse_escrow_log(line) else {
                    continue;
                };
                let event_id = MessageId::from_near(&tx.hash, receipt_index as u64);
                let meta = EventMeta {
                    message_id: event_id.clone(),
                    chain: Chain::Near,
                    block: height,
                    tx_hash: tx.hash.clone(),
                };
                if let Tick::Stop = self.handle_escrow_log(log, event_id, meta).await? {
                    return Ok(Tick::Stop);
                }
            }
        }
        Ok(Tick::Continue)
    }

    async fn handle_escrow_log(
        &mut self,
        log: EscrowLog,
        event_id: MessageId,
        meta: EventMeta,
    ) -> Result<Tick, RelayerError> {
        match log {
            EscrowLog::Created {
                order_id,
                amount_yocto,
                recipient,
            } => {
                if self.store.is_processed(&event_id).await? {
                    tracing::debug!(message_id = %event_id, "order creation already processed");
                    return Ok(Tick::Continue);
                }

                // The log line is not the whole order; the hashlock, the
                // deadline and the maker come from the contract view.
                let adapter = self.adapter.clone();
                let Some(order) = self
                    .rpc(|| {
                        let adapter = adapter.clone();
                        async move { adapter.get_order(order_id).await }
                    })
                    .await?
                else {
                    tracing::warn!(order_id, "order creation log without a stored order");
                    return Ok(Tick::Continue);
                };

                if order.maker == self.adapter.account_id().as_str() {
                    // Our own mirror order for an Ethereum-side deposit.
                    tracing::debug!(order_id, "observed our own mirror order");
                    return Ok(Tick::Continue);
                }

                let secret_hash = match SecretHash::from_hex(&order.hashlock) {
                    Ok(hash) => hash,
                    Err(e) => {
                        return Err(RelayerError::validation(
                            "near_log",
                            format!("order {order_id} hashlock: {e}"),
                        ))
                    }
                };

                let swap = self.swap_from_order(&event_id, order_id, amount_yocto, &recipient, &order, secret_hash)?;
                match self.store.begin(swap).await {
                    Ok(()) => {}
                    Err(StoreError::AlreadyExists(id)) => {
                        tracing::debug!(message_id = %id, "duplicate order event discarded");
                        return Ok(Tick::Continue);
                    }
                    Err(e) => return Err(e.into()),
                }

                let event = ChainEvent::NearOrderCreated {
                    meta,
                    order_id,
                    amount_yocto,
                    recipient,
                    secret_hash,
                    timelock: order.timelock,
                    initiator: order.maker,
                };
                self.forward(event_id, event).await
            }
            EscrowLog::Fulfilled { order_id, secret } => {
                let Some(swap) = self
                    .store
                    .find_by_ref(&EscrowRef::NearOrder(order_id))
                    .await?
                else {
                    tracing::debug!(order_id, "fulfillment for unknown order");
                    return Ok(Tick::Continue);
                };
                if swap.status.is_terminal() {
                    return Ok(Tick::Continue);
                }
                let event = ChainEvent::NearOrderFulfilled {
                    meta,
                    order_id,
                    secret,
                };
                self.forward(swap.message_id, event).await
            }
            EscrowLog::Refunded { order_id } => {
                let Some(swap) = self
                    .store
                    .find_by_ref(&EscrowRef::NearOrder(order_id))
                    .await?
                else {
                    tracing::debug!(order_id, "refund for unknown order");
                    return Ok(Tick::Continue);
                };
                if swap.status.is_terminal() {
                    return Ok(Tick::Continue);
                }
                let event = ChainEvent::NearOrderRefunded { meta, order_id };
                self.forward(swap.message_id, event).await
            }
        }
    }

    fn swap_from_order(
        &self,
        event_id: &MessageId,
        order_id: u64,
        amount_yocto: u128,
        recipient: &str,
        order: &OrderView,
        secret_hash: SecretHash,
    ) -> Result<Swap, RelayerError> {
        let amount_source = relayer_types::Amount::Yocto(amount_yocto);
        let now = Utc::now();
        Ok(Swap {
            message_id: event_id.clone(),
            direction: Direction::NearToEth,
            secret_hash,
            secret: None,
            amount_dest: amount_source.mirrored()?,
            amount_source,
            initiator: order.maker.clone(),
            recipient: recipient.to_string(),
            timelock_source: order.timelock,
            timelock_dest: 0,
            status: SwapStatus::Observed,
            source_ref: Some(EscrowRef::NearOrder(order_id)),
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

enum HeightOutcome {
    Done,
    ChunkMissing,
    Stop,
}

#[async_trait::async_trait]
impl<R: NearRpc + 'static> RunnableService for NearListener<R> {
    const NAME: &'static str = "near-listener";

    type SharedData = watch::Receiver<Option<u64>>;

    fn shared_data(&self) -> Self::SharedData {
        self.cursor_rx.clone()
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.cursor = self.store.cursor(Chain::Near).await?;
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
                        "near provider unreachable after {} reconnect attempts: {e}",
                        self.config.max_reconnect_attempts
                    ));
                }
                let backoff = reconnect_backoff(self.consecutive_failures);
                tracing::warn!(
                    error = %e,
                    attempt = self.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    "near provider error, backing off"
                );
                sleep_or_stop(backoff, watcher).await;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        Ok(())
    }
}

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
