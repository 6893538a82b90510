//! Port to a NEAR node, with the subset of the JSON-RPC views the relayer
//! consumes. Everything is decoded at this boundary; callers never see raw
//! JSON.

use async_trait::async_trait;
use relayer_types::RelayerError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub chain_id: String,
    pub latest_height: u64,
    pub latest_block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockView {
    pub height: u64,
    pub hash: String,
    pub chunks: Vec<ChunkHeaderView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeaderView {
    pub chunk_hash: String,
    /// Chunks older than their block appear again in later blocks; only the
    /// chunk first included at this height carries new transactions.
    pub height_included: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkView {
    pub transactions: Vec<ChunkTransactionView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTransactionView {
    pub hash: String,
    pub signer_id: String,
    pub receiver_id: String,
}

/// Final execution outcome of a transaction, reduced to what the relayer
/// reads: the return value and the log lines of every receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxOutcome {
    /// Base64 `SuccessValue`, present when the call returned successfully.
    pub success_value: Option<String>,
    /// Human-readable failure from the execution status, if any.
    pub failure: Option<String>,
    pub receipts: Vec<ReceiptOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptOutcome {
    pub logs: Vec<String>,
}

#[async_trait]
pub trait NearRpc: Send + Sync {
    async fn status(&self) -> Result<NodeStatus, RelayerError>;

    /// The latest block at `finality: final`.
    async fn block_final(&self) -> Result<BlockView, RelayerError>;

    /// A block by height. `Ok(None)` when the height was skipped by the
    /// chain (NEAR heights have gaps).
    async fn block_at(&self, height: u64) -> Result<Option<BlockView>, RelayerError>;

    /// A chunk by hash. `Ok(None)` is the chunk-missing response: not an
    /// error, but the caller must not advance past the enclosing block.
    async fn chunk(&self, chunk_hash: &str) -> Result<Option<ChunkView>, RelayerError>;

    /// `call_function` view; returns the raw result bytes.
    async fn view_function(
        &self,
        contract: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<Vec<u8>, RelayerError>;

    async fn access_key_nonce(
        &self,
        account: &str,
        public_key: &str,
    ) -> Result<u64, RelayerError>;

    /// Submit a signed transaction and wait for its final outcome.
    async fn send_tx(&self, signed_tx_base64: String) -> Result<TxOutcome, RelayerError>;

    /// Final outcome of an already-submitted transaction.
    async fn tx_status(&self, tx_hash: &str, sender: &str) -> Result<TxOutcome, RelayerError>;
}
