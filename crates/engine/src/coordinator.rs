//! The swap state machine. One coordinator instance serves both directions;
//! the executor guarantees per-swap serialization, so every handler here can
//! assume it is the only writer for its swap.
//!
//! ```text
//! observed -> mirroring -> awaiting_settlement -> propagating -> settled
//!     \            \               \                   \
//!      `-> failed   `-> failed      `-> refunding ------`-> refunding -> refunded | failed
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use relayer_storage::{StoreError, StoreHandle};
use relayer_types::{
    ChainEvent,
    Direction,
    ErrorSnapshot,
    EscrowRef,
    RelayerError,
    Secret,
    SecurityIssue,
    Swap,
    SwapStatus,
};

use crate::{
    executor::{JobHandler, Work, WorkKind},
    policies::{run_with_retries, Policies},
    ports::{EthHome, NearHome},
};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Δ: the destination deadline always precedes the source deadline by at
    /// least this margin.
    pub safety_margin_secs: u64,
    /// Headroom the source deadline must have beyond Δ at observation time.
    pub min_headroom_secs: u64,
    /// Clock-skew guard before a refund is submitted.
    pub refund_grace_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 86_400,
            min_headroom_secs: 3_600,
            refund_grace_secs: 60,
        }
    }
}

/// `timelock_dest` is acceptable iff it precedes `timelock_source` by at
/// least the safety margin.
pub fn check_timelock_pair(
    timelock_source: u64,
    timelock_dest: u64,
    safety_margin_secs: u64,
) -> Result<(), RelayerError> {
    if timelock_dest.saturating_add(safety_margin_secs) <= timelock_source {
        Ok(())
    } else {
        Err(SecurityIssue::UnsafeTimelock.into())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_eth_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_near_account(value: &str) -> bool {
    (2..=64).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
        && !value.starts_with('.')
        && !value.ends_with('.')
}

pub struct Coordinator<E, N> {
    store: StoreHandle,
    eth: Arc<E>,
    near: Arc<N>,
    config: CoordinatorConfig,
    /// Live view of the retry-policy table; a safe config reload swaps the
    /// whole value at once.
    policies: tokio::sync::watch::Receiver<Policies>,
}

#[async_trait]
impl<E: EthHome + 'static, N: NearHome + 'static> JobHandler for Coordinator<E, N> {
    async fn handle(&self, work: Work) {
        if let Err(e) = self.process(work).await {
            tracing::error!(error = %e, "coordinator step failed");
        }
    }
}

impl<E: EthHome, N: NearHome> Coordinator<E, N> {
    fn policies(&self) -> Policies {
        self.policies.borrow().clone()
    }

    pub fn new(
        store: StoreHandle,
        eth: Arc<E>,
        near: Arc<N>,
        config: CoordinatorConfig,
        policies: tokio::sync::watch::Receiver<Policies>,
    ) -> Self {
        Self {
            store,
            eth,
            near,
            config,
            policies,
        }
    }

    async fn process(&self, work: Work) -> Result<(), StoreError> {
        let Some(swap) = self.store.get(&work.key).await? else {
            tracing::warn!(key = %work.key, "work for an unknown swap");
            return Ok(());
        };

        if swap.status.is_terminal() {
            tracing::debug!(key = %work.key, status = %swap.status, "work for a terminal swap");
            return Ok(());
        }

        match (swap.status, &work.kind) {
            (SwapStatus::Observed, WorkKind::Event(event)) if event.is_deposit() => {
                self.validate_and_mirror(swap).await
            }
            (SwapStatus::Observed, _) => Ok(()),

            // A crash can leave a swap mid-mirror; the mirror step itself is
            // idempotent (it looks the escrow up by hashlock first).
            (SwapStatus::Mirroring, _) => self.mirror(swap).await,

            (SwapStatus::AwaitingSettlement, WorkKind::Event(event)) => {
                if let Some(secret) = revealed_secret(event) {
                    self.propagate(swap, secret).await
                } else if is_refund_observation(event) {
                    self.record_observed_refund(swap).await
                } else {
                    tracing::debug!(key = %swap.message_id, kind = event.kind_name(), "event ignored in awaiting_settlement");
                    Ok(())
                }
            }
            (SwapStatus::AwaitingSettlement, WorkKind::RefundSweep) => {
                if unix_now() > swap.timelock_dest {
                    let swap = self.store.transition(
                        &swap.message_id,
                        SwapStatus::AwaitingSettlement,
                        SwapStatus::Refunding,
                        |_| {},
                    )
                    .await?;
                    self.refund(swap).await
                } else {
                    Ok(())
                }
            }

            (SwapStatus::Propagating, WorkKind::Event(event)) if is_refund_observation(event) => {
                self.record_observed_refund(swap).await
            }
            (SwapStatus::Propagating, _) => {
                // Either a replayed settlement event or the sweep; both mean
                // "try to finish the withdrawal".
                match swap.secret {
                    Some(secret) => self.attempt_withdraw(swap, secret).await,
                    None => {
                        tracing::error!(key = %swap.message_id, "propagating without a stored secret");
                        Ok(())
                    }
                }
            }

            (SwapStatus::Refunding, WorkKind::Event(event)) if is_refund_observation(event) => {
                self.record_observed_refund(swap).await
            }
            (SwapStatus::Refunding, _) => self.refund(swap).await,

            (SwapStatus::Settled | SwapStatus::Refunded | SwapStatus::Failed, _) => Ok(()),
        }
    }

    /// `observed -> mirroring -> awaiting_settlement | failed`.
    async fn validate_and_mirror(&self, swap: Swap) -> Result<(), StoreError> {
        let now = unix_now();
        if let Err(error) = self.validate(&swap, now) {
            tracing::warn!(key = %swap.message_id, error = %error, "swap rejected");
            self.store
                .mark_terminal(
                    &swap.message_id,
                    SwapStatus::Observed,
                    SwapStatus::Failed,
                    move |record| record.last_error = Some(ErrorSnapshot::capture(&error)),
                )
                .await?;
            return Ok(());
        }

        let timelock_dest = swap.timelock_source - self.config.safety_margin_secs;
        let swap = self
            .store
            .transition(
                &swap.message_id,
                SwapStatus::Observed,
                SwapStatus::Mirroring,
                move |record| record.timelock_dest = timelock_dest,
            )
            .await?;
        self.mirror(swap).await
    }

    /// `mirroring -> awaiting_settlement | failed`. Safe to re-enter: an
    /// escrow that already exists for this hashlock is adopted, not
    /// recreated.
    async fn mirror(&self, swap: Swap) -> Result<(), StoreError> {
        let mut attempts = 0u32;
        let now = unix_now();
        let result = match swap.direction {
            Direction::EthToNear => {
                let near = self.near.clone();
                let hash = swap.secret_hash;
                let existing = match near.find_order_by_hashlock(&hash).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        tracing::warn!(error = %e, "hashlock lookup failed, proceeding to create");
                        None
                    }
                };
                match existing {
                    Some(order_id) => Ok(EscrowRef::NearOrder(order_id)),
                    None => {
                        let duration = swap.timelock_dest.saturating_sub(now);
                        let recipient = swap.recipient.clone();
                        let amount = swap.amount_dest;
                        run_with_retries(&self.policies().near_function_call, &mut attempts, || {
                            let near = near.clone();
                            let recipient = recipient.clone();
                            async move {
                                near.create_order(&recipient, &hash, duration, &amount).await
                            }
                        })
                        .await
                        .map(EscrowRef::NearOrder)
                    }
                }
            }
            Direction::NearToEth => {
                let eth = self.eth.clone();
                let hash = swap.secret_hash;
                let existing = match eth.find_escrow_by_hashlock(&hash).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        tracing::warn!(error = %e, "hashlock lookup failed, proceeding to create");
                        None
                    }
                };
                match existing {
                    Some(escrow) => Ok(EscrowRef::Eth(escrow)),
                    None => {
                        let timelock = swap.timelock_dest;
                        let initiator = swap.initiator.clone();
                        let recipient = swap.recipient.clone();
                        let amount = swap.amount_dest;
                        run_with_retries(&self.policies().factory_tx, &mut attempts, || {
                            let eth = eth.clone();
                            let initiator = initiator.clone();
                            let recipient = recipient.clone();
                            async move {
                                eth.create_escrow(&amount, &hash, timelock, &initiator, &recipient)
                                    .await
                            }
                        })
                        .await
                        .map(EscrowRef::Eth)
                    }
                }
            }
        };

        match result {
            Ok(escrow_ref) => {
                tracing::info!(key = %swap.message_id, escrow = ?escrow_ref, "mirror escrow ready");
                self.store
                    .transition(
                        &swap.message_id,
                        SwapStatus::Mirroring,
                        SwapStatus::AwaitingSettlement,
                        move |record| {
                            record.escrow_ref = Some(escrow_ref);
                            *record.attempts.entry("submit_mirror_tx".into()).or_insert(0) +=
                                attempts;
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(key = %swap.message_id, error = %error, "mirror submission failed");
                self.store
                    .mark_terminal(
                        &swap.message_id,
                        SwapStatus::Mirroring,
                        SwapStatus::Failed,
                        move |record| {
                            record.last_error = Some(ErrorSnapshot::capture(&error));
                            *record.attempts.entry("submit_mirror_tx".into()).or_insert(0) +=
                                attempts;
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// `awaiting_settlement -> propagating -> ...` after a reveal.
    async fn propagate(&self, swap: Swap, secret: Secret) -> Result<(), StoreError> {
        if !secret.matches(&swap.secret_hash) {
            let error = RelayerError::Security(SecurityIssue::PreimageMismatch);
            tracing::warn!(key = %swap.message_id, "revealed preimage does not match the hashlock");
            self.store
                .annotate(&swap.message_id, move |record| {
                    record.last_error = Some(ErrorSnapshot::capture(&error));
                })
                .await?;
            // No propagation. The timelock path settles this swap.
            return Ok(());
        }

        let swap = self
            .store
            .transition(
                &swap.message_id,
                SwapStatus::AwaitingSettlement,
                SwapStatus::Propagating,
                move |record| record.secret = Some(secret),
            )
            .await?;
        self.attempt_withdraw(swap, secret).await
    }

    /// `propagating -> settled | refunding | propagating`. Re-reads the
    /// withdrawal target before submitting.
    async fn attempt_withdraw(&self, swap: Swap, secret: Secret) -> Result<(), StoreError> {
        let now = unix_now();

        // Pre-submit re-read of the chain the withdrawal goes to.
        let target = match self.withdraw_target_state(&swap).await {
            Ok(target) => target,
            Err(error) => {
                self.store
                    .annotate(&swap.message_id, move |record| {
                        record.last_error = Some(ErrorSnapshot::capture(&error));
                    })
                    .await?;
                return Ok(());
            }
        };

        if target.settled {
            tracing::info!(key = %swap.message_id, "withdrawal already settled on chain");
            self.store
                .mark_terminal(
                    &swap.message_id,
                    SwapStatus::Propagating,
                    SwapStatus::Settled,
                    |_| {},
                )
                .await?;
            return Ok(());
        }
        if now > target.timelock {
            tracing::warn!(key = %swap.message_id, "withdrawal deadline crossed mid-flight");
            self.store
                .transition(
                    &swap.message_id,
                    SwapStatus::Propagating,
                    SwapStatus::Refunding,
                    |_| {},
                )
                .await?;
            return Ok(());
        }

        let mut attempts = 0u32;
        let result = match swap.direction {
            Direction::EthToNear => {
                let Some(EscrowRef::Eth(deposit_id)) = swap.source_ref.clone() else {
                    tracing::error!(key = %swap.message_id, "eth_to_near swap without a deposit reference");
                    return Ok(());
                };
                let eth = self.eth.clone();
                run_with_retries(&self.policies().withdraw_tx, &mut attempts, || {
                    let eth = eth.clone();
                    let deposit_id = deposit_id.clone();
                    async move { eth.complete_withdrawal(&deposit_id, &secret).await }
                })
                .await
            }
            Direction::NearToEth => {
                let Some(EscrowRef::NearOrder(order_id)) = swap.source_ref else {
                    tracing::error!(key = %swap.message_id, "near_to_eth swap without an order reference");
                    return Ok(());
                };
                let near = self.near.clone();
                run_with_retries(&self.policies().withdraw_tx, &mut attempts, || {
                    let near = near.clone();
                    async move { near.fulfill_order(order_id, &secret).await }
                })
                .await
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(key = %swap.message_id, "secret propagated, swap settled");
                self.store
                    .mark_terminal(
                        &swap.message_id,
                        SwapStatus::Propagating,
                        SwapStatus::Settled,
                        move |record| {
                            *record.attempts.entry("submit_withdraw_tx".into()).or_insert(0) +=
                                attempts;
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(error) => {
                // Did someone beat us to it, or did the deadline pass while
                // we were retrying?
                if let Ok(target) = self.withdraw_target_state(&swap).await {
                    if target.settled {
                        self.store
                            .mark_terminal(
                                &swap.message_id,
                                SwapStatus::Propagating,
                                SwapStatus::Settled,
                                |_| {},
                            )
                            .await?;
                        return Ok(());
                    }
                    if unix_now() > target.timelock {
                        self.store
                            .transition(
                                &swap.message_id,
                                SwapStatus::Propagating,
                                SwapStatus::Refunding,
                                |_| {},
                            )
                            .await?;
                        return Ok(());
                    }
                }
                tracing::warn!(key = %swap.message_id, error = %error, "withdrawal submission failed");
                self.store
                    .annotate(&swap.message_id, move |record| {
                        record.last_error = Some(ErrorSnapshot::capture(&error));
                        *record.attempts.entry("submit_withdraw_tx".into()).or_insert(0) +=
                            attempts;
                    })
                    .await?;
                Ok(())
            }
        }
    }

    /// State of the escrow the withdrawal transaction goes to (the deposit
    /// side of this swap).
    async fn withdraw_target_state(
        &self,
        swap: &Swap,
    ) -> Result<crate::ports::MirrorState, RelayerError> {
        match swap.direction {
            Direction::EthToNear => {
                let Some(EscrowRef::Eth(deposit_id)) = swap.source_ref.clone() else {
                    return Err(RelayerError::validation("swap", "missing deposit reference"));
                };
                let state = self.eth.deposit_state(&deposit_id).await?;
                Ok(crate::ports::MirrorState {
                    settled: state.withdrawn,
                    refunded: false,
                    timelock: state.timelock,
                })
            }
            Direction::NearToEth => {
                let Some(EscrowRef::NearOrder(order_id)) = swap.source_ref else {
                    return Err(RelayerError::validation("swap", "missing order reference"));
                };
                self.near
                    .order_state(order_id)
                    .await?
                    .ok_or_else(|| RelayerError::validation("swap", "order vanished"))
            }
        }
    }

    /// `refunding -> refunded | failed`, gated on the grace period.
    async fn refund(&self, swap: Swap) -> Result<(), StoreError> {
        let now = unix_now();
        if now <= swap.timelock_dest.saturating_add(self.config.refund_grace_secs) {
            // Too early; the sweep will try again.
            return Ok(());
        }

        let Some(escrow_ref) = swap.escrow_ref.clone() else {
            tracing::error!(key = %swap.message_id, "refunding without a mirror escrow");
            let error = RelayerError::validation("swap", "no escrow to refund");
            self.store
                .mark_terminal(
                    &swap.message_id,
                    SwapStatus::Refunding,
                    SwapStatus::Failed,
                    move |record| record.last_error = Some(ErrorSnapshot::capture(&error)),
                )
                .await?;
            return Ok(());
        };

        let mut attempts = 0u32;
        let result = match &escrow_ref {
            EscrowRef::NearOrder(order_id) => {
                let near = self.near.clone();
                let order_id = *order_id;
                run_with_retries(&self.policies().refund_tx, &mut attempts, || {
                    let near = near.clone();
                    async move { near.refund_order(order_id).await }
                })
                .await
            }
            EscrowRef::Eth(escrow) => {
                let eth = self.eth.clone();
                let escrow = escrow.clone();
                run_with_retries(&self.policies().refund_tx, &mut attempts, || {
                    let eth = eth.clone();
                    let escrow = escrow.clone();
                    async move { eth.refund_escrow(&escrow).await }
                })
                .await
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(key = %swap.message_id, "mirror escrow refunded");
                self.store
                    .mark_terminal(
                        &swap.message_id,
                        SwapStatus::Refunding,
                        SwapStatus::Refunded,
                        move |record| {
                            *record.attempts.entry("submit_refund_tx".into()).or_insert(0) +=
                                attempts;
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(key = %swap.message_id, error = %error, "refund submission failed");
                self.store
                    .mark_terminal(
                        &swap.message_id,
                        SwapStatus::Refunding,
                        SwapStatus::Failed,
                        move |record| {
                            record.last_error = Some(ErrorSnapshot::capture(&error));
                            *record.attempts.entry("submit_refund_tx".into()).or_insert(0) +=
                                attempts;
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// The mirror escrow's refund was observed on chain (ours or someone
    /// else's); the swap is refunded without submitting anything.
    async fn record_observed_refund(&self, swap: Swap) -> Result<(), StoreError> {
        let id = swap.message_id.clone();
        let refunding = if swap.status == SwapStatus::Refunding {
            swap
        } else {
            self.store
                .transition(&id, swap.status, SwapStatus::Refunding, |_| {})
                .await?
        };
        self.store
            .mark_terminal(&id, refunding.status, SwapStatus::Refunded, |_| {})
            .await?;
        Ok(())
    }

    fn validate(&self, swap: &Swap, now: u64) -> Result<(), RelayerError> {
        if swap.amount_source.is_zero() {
            return Err(RelayerError::validation("amount", "must be positive"));
        }
        if swap.secret_hash.as_bytes() == &[0u8; 32] {
            return Err(RelayerError::validation("secret_hash", "must not be zero"));
        }
        match swap.direction {
            Direction::EthToNear => {
                if !is_eth_address(&swap.initiator) {
                    return Err(RelayerError::validation("initiator", swap.initiator.clone()));
                }
                if !is_near_account(&swap.recipient) {
                    return Err(RelayerError::validation("recipient", swap.recipient.clone()));
                }
            }
            Direction::NearToEth => {
                if !is_near_account(&swap.initiator) {
                    return Err(RelayerError::validation("initiator", swap.initiator.clone()));
                }
                if !is_eth_address(&swap.recipient) {
                    return Err(RelayerError::validation("recipient", swap.recipient.clone()));
                }
            }
        }

        if swap.timelock_source <= now {
            return Err(SecurityIssue::UnsafeTimelock.into());
        }
        // The destination deadline is source − Δ; it must still leave
        // headroom to act.
        let min_source = now
            .saturating_add(self.config.safety_margin_secs)
            .saturating_add(self.config.min_headroom_secs);
        if swap.timelock_source <= min_source {
            return Err(SecurityIssue::UnsafeTimelock.into());
        }
        check_timelock_pair(
            swap.timelock_source,
            swap.timelock_source - self.config.safety_margin_secs,
            self.config.safety_margin_secs,
        )
    }
}

/// Extract the revealed preimage from a settlement observation.
fn revealed_secret(event: &ChainEvent) -> Option<Secret> {
    match event {
        ChainEvent::NearOrderFulfilled { secret, .. } => Some(*secret),
        ChainEvent::EthWithdrawalCompleted { secret, .. } => Some(*secret),
        _ => None,
    }
}

fn is_refund_observation(event: &ChainEvent) -> bool {
    matches!(event, ChainEvent::NearOrderRefunded { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{DepositState, MockEthHome, MockNearHome};
    use chrono::Utc;
    use ethers_core::types::U256;
    use relayer_services::RetryPolicy;
    use relayer_types::{Amount, Chain, EventMeta, MessageId};
    use std::time::Duration;

    const DAY: u64 = 86_400;

    fn watch_policies() -> tokio::sync::watch::Receiver<Policies> {
        let (_tx, rx) = tokio::sync::watch::channel(fast_policies());
        rx
    }

    fn fast_policies() -> Policies {
        let fast = RetryPolicy {
            retries: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2,
            jitter: false,
        };
        Policies {
            factory_tx: fast,
            withdraw_tx: fast,
            refund_tx: fast,
            near_view: fast,
            near_function_call: fast,
            eth_query_filter: fast,
            eth_get_logs: fast,
        }
    }

    struct Fixture {
        store: StoreHandle,
        eth: MockEthHome,
        near: MockNearHome,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = relayer_storage::spawn_store(dir.path()).unwrap();
            Self {
                store,
                eth: MockEthHome::new(),
                near: MockNearHome::new(),
                _dir: dir,
            }
        }

        fn coordinator(
            self,
        ) -> (
            Coordinator<MockEthHome, MockNearHome>,
            StoreHandle,
            tempfile::TempDir,
        ) {
            let store = self.store.clone();
            (
                Coordinator::new(
                    self.store,
                    Arc::new(self.eth),
                    Arc::new(self.near),
                    CoordinatorConfig::default(),
                    watch_policies(),
                ),
                store,
                self._dir,
            )
        }
    }

    fn secret() -> Secret {
        Secret::new([7u8; 32])
    }

    fn eth_deposit_swap(id: &str, timelock_source: u64) -> Swap {
        let now = Utc::now();
        Swap {
            message_id: MessageId::parse(id).unwrap(),
            direction: Direction::EthToNear,
            secret_hash: secret().digest(),
            secret: None,
            amount_source: Amount::Wei(U256::from(10_000_000_000_000_000u64)),
            amount_dest: Amount::Yocto(10_000_000_000_000_000_000_000),
            initiator: "0x742d35cc6634c0532925a3b844bc454e4438f44e".into(),
            recipient: "alice.near".into(),
            timelock_source,
            timelock_dest: 0,
            status: SwapStatus::Observed,
            source_ref: Some(EscrowRef::Eth(format!("0x{}", "d1".repeat(32)))),
            escrow_ref: None,
            attempts: Default::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn near_deposit_swap(id: &str, timelock_source: u64) -> Swap {
        let mut swap = eth_deposit_swap(id, timelock_source);
        swap.direction = Direction::NearToEth;
        swap.initiator = "bob.near".into();
        swap.recipient = "0x742d35cc6634c0532925a3b844bc454e4438f44e".into();
        swap.amount_source = Amount::Yocto(500_000_000_000_000_000_000_000);
        swap.amount_dest = Amount::Wei(U256::from(500_000_000_000_000_000u64));
        swap.source_ref = Some(EscrowRef::NearOrder(5));
        swap
    }

    fn deposit_event(swap: &Swap) -> ChainEvent {
        let meta = EventMeta {
            message_id: swap.message_id.clone(),
            chain: Chain::Ethereum,
            block: 80,
            tx_hash: "0xabc".into(),
        };
        ChainEvent::EthDepositInitiated {
            meta,
            deposit_id: ethers_core::types::H256::repeat_byte(0xd1),
            sender: ethers_core::types::Address::repeat_byte(0xaa),
            near_recipient: swap.recipient.clone(),
            token: ethers_core::types::Address::zero(),
            amount: U256::from(10_000_000_000_000_000u64),
            fee: U256::one(),
            timestamp: 0,
            secret_hash: swap.secret_hash,
            timelock: swap.timelock_source,
        }
    }

    fn fulfillment_event(key: &MessageId, order_id: u64, secret: Secret) -> Work {
        Work {
            key: key.clone(),
            kind: WorkKind::Event(ChainEvent::NearOrderFulfilled {
                meta: EventMeta {
                    message_id: MessageId::parse("near:TxF:0").unwrap(),
                    chain: Chain::Near,
                    block: 20,
                    tx_hash: "TxF".into(),
                },
                order_id,
                secret,
            }),
        }
    }

    fn now() -> u64 {
        unix_now()
    }

    #[tokio::test]
    async fn happy_eth_to_near_mirror_creates_one_order() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa1:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();

        fixture
            .near
            .expect_find_order_by_hashlock()
            .returning(|_| Ok(None));
        let expected_duration_max = 6 * DAY;
        fixture
            .near
            .expect_create_order()
            .times(1)
            .withf(move |recipient, _, duration, amount| {
                recipient == "alice.near"
                    && *duration <= expected_duration_max
                    && *duration > expected_duration_max - 120
                    && matches!(amount, Amount::Yocto(_))
            })
            .returning(|_, _, _, _| Ok(17));

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::Event(deposit_event(&swap)),
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::AwaitingSettlement);
        assert_eq!(stored.escrow_ref, Some(EscrowRef::NearOrder(17)));
        assert_eq!(stored.timelock_dest, swap.timelock_source - DAY);
    }

    #[tokio::test]
    async fn unsafe_timelock_fails_without_any_chain_calls() {
        let mut fixture = Fixture::new();
        // 30 seconds of headroom is far below Δ + headroom.
        let swap = eth_deposit_swap("eth:0xa2:0", now() + 30);
        fixture.store.begin(swap.clone()).await.unwrap();

        fixture.near.expect_create_order().times(0);
        fixture.near.expect_find_order_by_hashlock().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::Event(deposit_event(&swap)),
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Failed);
        let last_error = stored.last_error.unwrap();
        assert_eq!(last_error.kind, "security");
        assert!(last_error.message.contains("timelock"));
        assert!(store.is_processed(&swap.message_id).await.unwrap());
    }

    #[tokio::test]
    async fn zero_amount_is_rejected() {
        let mut fixture = Fixture::new();
        let mut swap = eth_deposit_swap("eth:0xb1:0", now() + 7 * DAY);
        swap.amount_source = Amount::Wei(U256::zero());
        fixture.store.begin(swap.clone()).await.unwrap();
        fixture.near.expect_create_order().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::Event(deposit_event(&swap)),
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Failed);
        assert_eq!(stored.last_error.unwrap().kind, "validation");
    }

    #[tokio::test]
    async fn network_flap_during_mirror_retries_within_policy() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa3:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();

        fixture
            .near
            .expect_find_order_by_hashlock()
            .returning(|_| Ok(None));
        let mut calls = 0;
        fixture
            .near
            .expect_create_order()
            .times(3)
            .returning(move |_, _, _, _| {
                calls += 1;
                if calls < 3 {
                    Err(RelayerError::network(Chain::Near, "send_tx", "flap"))
                } else {
                    Ok(21)
                }
            });

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::Event(deposit_event(&swap)),
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::AwaitingSettlement);
        assert_eq!(stored.attempts.get("submit_mirror_tx"), Some(&3));
    }

    #[tokio::test]
    async fn duplicate_deposit_event_does_not_mirror_twice() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa4:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();

        fixture
            .near
            .expect_find_order_by_hashlock()
            .returning(|_| Ok(None));
        fixture
            .near
            .expect_create_order()
            .times(1)
            .returning(|_, _, _, _| Ok(17));

        let (coordinator, store, _dir) = fixture.coordinator();
        let work = Work {
            key: swap.message_id.clone(),
            kind: WorkKind::Event(deposit_event(&swap)),
        };
        coordinator.handle(work.clone()).await;
        // The same event delivered again: the swap is no longer `observed`,
        // so no second mirror is submitted.
        coordinator.handle(work).await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::AwaitingSettlement);
    }

    #[tokio::test]
    async fn mirroring_resume_adopts_the_existing_escrow() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa5:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        // Simulate a crash after the mirror tx landed but before the record
        // advanced: state is `mirroring`, the order exists on chain.
        fixture
            .store
            .transition(
                &swap.message_id,
                SwapStatus::Observed,
                SwapStatus::Mirroring,
                |record| record.timelock_dest = record.timelock_source - DAY,
            )
            .await
            .unwrap();

        fixture
            .near
            .expect_find_order_by_hashlock()
            .returning(|_| Ok(Some(33)));
        fixture.near.expect_create_order().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::RefundSweep,
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::AwaitingSettlement);
        assert_eq!(stored.escrow_ref, Some(EscrowRef::NearOrder(33)));
    }

    #[tokio::test]
    async fn reveal_propagates_the_secret_and_settles() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa6:0", now() + 7 * DAY);
        let deposit_id = format!("0x{}", "d1".repeat(32));
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;

        let far_deadline = now() + 7 * DAY;
        fixture
            .eth
            .expect_deposit_state()
            .withf(move |id| id == deposit_id)
            .returning(move |_| {
                Ok(DepositState {
                    withdrawn: false,
                    timelock: far_deadline,
                })
            });
        fixture
            .eth
            .expect_complete_withdrawal()
            .times(1)
            .withf(|_, s| s.matches(&secret().digest()))
            .returning(|_, _| Ok(()));

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(fulfillment_event(&swap.message_id, 17, secret()))
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Settled);
        // Settled implies a stored preimage matching the hashlock.
        assert!(stored.secret.unwrap().matches(&stored.secret_hash));
        assert!(store.is_processed(&swap.message_id).await.unwrap());
    }

    #[tokio::test]
    async fn preimage_mismatch_is_recorded_and_not_propagated() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa7:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;

        fixture.eth.expect_complete_withdrawal().times(0);
        fixture.eth.expect_deposit_state().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        let wrong = Secret::new([8u8; 32]);
        coordinator
            .handle(fulfillment_event(&swap.message_id, 17, wrong))
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::AwaitingSettlement);
        let last_error = stored.last_error.unwrap();
        assert_eq!(last_error.kind, "security");
        assert!(last_error.message.contains("preimage"));
    }

    #[tokio::test]
    async fn deadline_crossed_mid_flight_moves_to_refunding() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa8:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;

        // The pre-submit re-read finds the withdrawal deadline in the past.
        fixture.eth.expect_deposit_state().returning(|_| {
            Ok(DepositState {
                withdrawn: false,
                timelock: 1,
            })
        });
        fixture.eth.expect_complete_withdrawal().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(fulfillment_event(&swap.message_id, 17, secret()))
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Refunding);
    }

    #[tokio::test]
    async fn front_ran_withdrawal_settles_without_submitting() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xa9:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;

        fixture.eth.expect_deposit_state().returning(|_| {
            Ok(DepositState {
                withdrawn: true,
                timelock: 0,
            })
        });
        fixture.eth.expect_complete_withdrawal().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(fulfillment_event(&swap.message_id, 17, secret()))
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Settled);
    }

    #[tokio::test]
    async fn expired_swap_refunds_through_the_sweep() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xaa:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;
        // Force the destination deadline (and its grace) into the past.
        fixture
            .store
            .annotate(&swap.message_id, |record| record.timelock_dest = 100)
            .await
            .unwrap();

        fixture
            .near
            .expect_refund_order()
            .times(1)
            .withf(|order_id| *order_id == 17)
            .returning(|_| Ok(()));

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::RefundSweep,
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Refunded);
    }

    #[tokio::test]
    async fn refund_waits_for_the_grace_period() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xab:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;
        // Expired, but within the grace window.
        let just_expired = now() - 1;
        fixture
            .store
            .annotate(&swap.message_id, move |record| {
                record.timelock_dest = just_expired
            })
            .await
            .unwrap();

        fixture.near.expect_refund_order().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::RefundSweep,
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Refunding);
    }

    #[tokio::test]
    async fn near_to_eth_mirrors_through_the_factory() {
        let mut fixture = Fixture::new();
        let swap = near_deposit_swap("near:TxA:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();

        fixture
            .eth
            .expect_find_escrow_by_hashlock()
            .returning(|_| Ok(None));
        fixture
            .eth
            .expect_create_escrow()
            .times(1)
            .withf(|amount, _, _, initiator, recipient| {
                matches!(amount, Amount::Wei(_))
                    && initiator == "bob.near"
                    && recipient == "0x742d35cc6634c0532925a3b844bc454e4438f44e"
            })
            .returning(|_, _, _, _, _| Ok("0xcccccccccccccccccccccccccccccccccccccccc".into()));

        let (coordinator, store, _dir) = fixture.coordinator();
        let near_created = Work {
            key: swap.message_id.clone(),
            kind: WorkKind::Event(ChainEvent::NearOrderCreated {
                meta: EventMeta {
                    message_id: swap.message_id.clone(),
                    chain: Chain::Near,
                    block: 10,
                    tx_hash: "TxA".into(),
                },
                order_id: 5,
                amount_yocto: 500_000_000_000_000_000_000_000,
                recipient: swap.recipient.clone(),
                secret_hash: swap.secret_hash,
                timelock: swap.timelock_source,
                initiator: swap.initiator.clone(),
            }),
        };
        coordinator.handle(near_created).await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::AwaitingSettlement);
        assert_eq!(
            stored.escrow_ref,
            Some(EscrowRef::Eth(
                "0xcccccccccccccccccccccccccccccccccccccccc".into()
            ))
        );
    }

    #[tokio::test]
    async fn observed_refund_completes_without_a_transaction() {
        let mut fixture = Fixture::new();
        let swap = eth_deposit_swap("eth:0xac:0", now() + 7 * DAY);
        fixture.store.begin(swap.clone()).await.unwrap();
        advance_to_awaiting(&fixture.store, &swap, EscrowRef::NearOrder(17)).await;

        fixture.near.expect_refund_order().times(0);

        let (coordinator, store, _dir) = fixture.coordinator();
        coordinator
            .handle(Work {
                key: swap.message_id.clone(),
                kind: WorkKind::Event(ChainEvent::NearOrderRefunded {
                    meta: EventMeta {
                        message_id: MessageId::parse("near:TxR:0").unwrap(),
                        chain: Chain::Near,
                        block: 30,
                        tx_hash: "TxR".into(),
                    },
                    order_id: 17,
                }),
            })
            .await;

        let stored = store.get(&swap.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Refunded);
    }

    #[tokio::test]
    async fn timelock_pair_boundary() {
        // dest == source − Δ is accepted.
        assert!(check_timelock_pair(1000 + DAY, 1000, DAY).is_ok());
        // One second less margin is rejected.
        assert!(check_timelock_pair(1000 + DAY, 1001, DAY).is_err());
    }

    async fn advance_to_awaiting(store: &StoreHandle, swap: &Swap, escrow: EscrowRef) {
        let dest = swap.timelock_source - DAY;
        store
            .transition(
                &swap.message_id,
                SwapStatus::Observed,
                SwapStatus::Mirroring,
                move |record| record.timelock_dest = dest,
            )
            .await
            .unwrap();
        store
            .transition(
                &swap.message_id,
                SwapStatus::Mirroring,
                SwapStatus::AwaitingSettlement,
                move |record| record.escrow_ref = Some(escrow),
            )
            .await
            .unwrap();
    }
}
