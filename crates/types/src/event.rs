use ethers_core::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    error::Chain,
    id::MessageId,
    secret::{Secret, SecretHash},
};

/// Provenance of one decoded chain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub message_id: MessageId,
    pub chain: Chain,
    /// Block number (Ethereum) or block height (NEAR) the event was observed
    /// in. Always at final depth.
    pub block: u64,
    /// Chain-native transaction reference: `0x`-hash on Ethereum, base58 hash
    /// on NEAR.
    pub tx_hash: String,
}

/// A decoded, finalized chain observation. This is the closed set of inputs
/// to the swap coordinators; adapters refuse to emit anything they cannot
/// decode into one of these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainEvent {
    /// `DepositInitiated` on the Ethereum bridge: a user locked funds headed
    /// for NEAR.
    EthDepositInitiated {
        meta: EventMeta,
        deposit_id: H256,
        sender: Address,
        near_recipient: String,
        token: Address,
        amount: U256,
        fee: U256,
        timestamp: u64,
        secret_hash: SecretHash,
        timelock: u64,
    },
    /// `MessageSent` on the Ethereum bridge.
    EthMessageSent {
        meta: EventMeta,
        message_ref: H256,
        deposit_id: H256,
        sender: Address,
        near_recipient: String,
        amount: U256,
        timestamp: u64,
    },
    /// `WithdrawalCompleted` on the Ethereum bridge: the secret was used on
    /// the Ethereum side.
    EthWithdrawalCompleted {
        meta: EventMeta,
        deposit_id: H256,
        recipient: Address,
        amount: U256,
        timestamp: u64,
        secret: Secret,
    },
    /// `EscrowCreated` from the Ethereum factory.
    EthEscrowCreated {
        meta: EventMeta,
        escrow: Address,
        initiator: Address,
        token: Address,
        amount: U256,
        target_chain: String,
        target_address: String,
    },
    /// Order-creation log from the NEAR escrow: a user locked NEAR headed for
    /// Ethereum.
    NearOrderCreated {
        meta: EventMeta,
        order_id: u64,
        amount_yocto: u128,
        recipient: String,
        secret_hash: SecretHash,
        timelock: u64,
        initiator: String,
    },
    /// Fulfillment log carrying the revealed preimage.
    NearOrderFulfilled {
        meta: EventMeta,
        order_id: u64,
        secret: Secret,
    },
    /// Refund log.
    NearOrderRefunded { meta: EventMeta, order_id: u64 },
}

impl ChainEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            ChainEvent::EthDepositInitiated { meta, .. }
            | ChainEvent::EthMessageSent { meta, .. }
            | ChainEvent::EthWithdrawalCompleted { meta, .. }
            | ChainEvent::EthEscrowCreated { meta, .. }
            | ChainEvent::NearOrderCreated { meta, .. }
            | ChainEvent::NearOrderFulfilled { meta, .. }
            | ChainEvent::NearOrderRefunded { meta, .. } => meta,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.meta().message_id
    }

    pub fn chain(&self) -> Chain {
        self.meta().chain
    }

    /// Stable name for log fields and attempt counters.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ChainEvent::EthDepositInitiated { .. } => "eth_deposit_initiated",
            ChainEvent::EthMessageSent { .. } => "eth_message_sent",
            ChainEvent::EthWithdrawalCompleted { .. } => "eth_withdrawal_completed",
            ChainEvent::EthEscrowCreated { .. } => "eth_escrow_created",
            ChainEvent::NearOrderCreated { .. } => "near_order_created",
            ChainEvent::NearOrderFulfilled { .. } => "near_order_fulfilled",
            ChainEvent::NearOrderRefunded { .. } => "near_order_refunded",
        }
    }

    /// Whether this event opens a new swap (as opposed to progressing an
    /// existing one).
    pub fn is_deposit(&self) -> bool {
        matches!(
            self,
            ChainEvent::EthDepositInitiated { .. } | ChainEvent::NearOrderCreated { .. }
        )
    }
}

/// One unit of work handed from a listener to the executor. `key` is the
/// message id of the swap the event belongs to (for progression events this
/// differs from the event's own id), so per-key serialization in the executor
/// is per-swap serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub key: MessageId,
    pub event: ChainEvent,
}
