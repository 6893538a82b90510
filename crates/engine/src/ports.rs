//! Ports the swap coordinators drive their side effects through. The state
//! machine never sees an RPC client, so every transition is testable against
//! mocks.

use async_trait::async_trait;
use relayer_types::{Amount, RelayerError, Secret, SecretHash};

/// On-chain state of a mirror escrow or order, re-read before acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorState {
    pub settled: bool,
    pub refunded: bool,
    /// Absolute unix-seconds deadline.
    pub timelock: u64,
}

/// State of an Ethereum-side deposit held by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositState {
    pub withdrawn: bool,
    pub timelock: u64,
}

/// Ethereum-side operations the coordinators need.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EthHome: Send + Sync {
    /// State of a bridge deposit, by its `0x`-hex deposit id.
    async fn deposit_state(&self, deposit_id: &str) -> Result<DepositState, RelayerError>;

    /// State of a factory escrow, by its `0x`-hex address.
    async fn escrow_state(&self, escrow: &str) -> Result<MirrorState, RelayerError>;

    /// Unlock a bridge deposit with the revealed preimage.
    async fn complete_withdrawal(
        &self,
        deposit_id: &str,
        secret: &Secret,
    ) -> Result<(), RelayerError>;

    /// Create the mirror escrow for a NEAR-side deposit. Returns the escrow
    /// address.
    async fn create_escrow(
        &self,
        amount: &Amount,
        secret_hash: &SecretHash,
        timelock: u64,
        initiator: &str,
        recipient: &str,
    ) -> Result<String, RelayerError>;

    async fn refund_escrow(&self, escrow: &str) -> Result<(), RelayerError>;

    /// The factory escrow already created for this hashlock, if any. Makes
    /// mirror creation idempotent across crashes.
    async fn find_escrow_by_hashlock(
        &self,
        hashlock: &SecretHash,
    ) -> Result<Option<String>, RelayerError>;
}

/// NEAR-side operations the coordinators need.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NearHome: Send + Sync {
    /// `None` when the order id is unknown to the escrow.
    async fn order_state(&self, order_id: u64) -> Result<Option<MirrorState>, RelayerError>;

    /// Create the mirror order for an Ethereum-side deposit, attaching the
    /// mirrored value. Returns the order id.
    async fn create_order(
        &self,
        recipient: &str,
        secret_hash: &SecretHash,
        timelock_duration_secs: u64,
        amount: &Amount,
    ) -> Result<u64, RelayerError>;

    async fn fulfill_order(&self, order_id: u64, secret: &Secret) -> Result<(), RelayerError>;

    async fn refund_order(&self, order_id: u64) -> Result<(), RelayerError>;

    /// The order already created for this hashlock, if any. Makes mirror
    /// creation idempotent across crashes.
    async fn find_order_by_hashlock(
        &self,
        hashlock: &SecretHash,
    ) -> Result<Option<u64>, RelayerError>;
}
