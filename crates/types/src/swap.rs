use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    amount::Amount,
    error::ErrorSnapshot,
    id::MessageId,
    secret::{Secret, SecretHash},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    EthToNear,
    NearToEth,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::EthToNear => f.write_str("eth_to_near"),
            Direction::NearToEth => f.write_str("near_to_eth"),
        }
    }
}

/// Stable reference to the mirror escrow the relayer created on the
/// destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "chain", content = "id", rename_all = "snake_case")]
pub enum EscrowRef {
    /// Ethereum escrow contract address, `0x`-prefixed.
    Eth(String),
    /// NEAR escrow order id.
    NearOrder(u64),
}

/// Lifecycle states of a swap, forming the partial order enforced by
/// [`SwapStatus::can_transition_to`]. Persisted records never move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Observed,
    Mirroring,
    AwaitingSettlement,
    Propagating,
    Settled,
    Refunding,
    Refunded,
    Failed,
}

impl SwapStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Settled | SwapStatus::Refunded | SwapStatus::Failed
        )
    }

    /// Legality of a persisted transition. Self-loops are allowed for the
    /// retryable submission states so a retry can refresh `attempts` and
    /// `last_error` without moving.
    pub fn can_transition_to(&self, to: SwapStatus) -> bool {
        use SwapStatus::*;
        match (*self, to) {
            (Observed, Mirroring) | (Observed, Failed) => true,
            (Mirroring, Mirroring)
            | (Mirroring, AwaitingSettlement)
            | (Mirroring, Failed) => true,
            (AwaitingSettlement, Propagating) | (AwaitingSettlement, Refunding) => true,
            (Propagating, Propagating)
            | (Propagating, Settled)
            | (Propagating, Refunding) => true,
            (Refunding, Refunding) | (Refunding, Refunded) | (Refunding, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SwapStatus::Observed => "observed",
            SwapStatus::Mirroring => "mirroring",
            SwapStatus::AwaitingSettlement => "awaiting_settlement",
            SwapStatus::Propagating => "propagating",
            SwapStatus::Settled => "settled",
            SwapStatus::Refunding => "refunding",
            SwapStatus::Refunded => "refunded",
            SwapStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The full record the relayer tracks for one cross-chain swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub message_id: MessageId,
    pub direction: Direction,
    pub secret_hash: SecretHash,
    /// Learned from the first chain that settles; present iff the swap
    /// reached `propagating` or beyond on the settlement path.
    pub secret: Option<Secret>,
    pub amount_source: Amount,
    pub amount_dest: Amount,
    pub initiator: String,
    pub recipient: String,
    /// Absolute unix-seconds deadline on the source chain.
    pub timelock_source: u64,
    /// Absolute unix-seconds deadline on the destination chain. Always at
    /// least the safety margin earlier than `timelock_source`.
    pub timelock_dest: u64,
    pub status: SwapStatus,
    /// Chain-native identifier of the source-side deposit: the bridge
    /// `depositId` for Ethereum deposits, the order id for NEAR deposits.
    /// Settlement and refund events correlate back through this.
    pub source_ref: Option<EscrowRef>,
    /// Reference to the mirror escrow once `submit_mirror_tx` confirmed.
    pub escrow_ref: Option<EscrowRef>,
    /// Per-operation attempt counters for the retry policies.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub last_error: Option<ErrorSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Swap {
    pub fn record_attempt(&mut self, operation: &str) -> u32 {
        let counter = self.attempts.entry(operation.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}
