//! Port to an Ethereum node. The production implementation wraps an HTTP
//! JSON-RPC provider; tests script one in memory.

use async_trait::async_trait;
use ethers_core::types::{
    transaction::eip2718::TypedTransaction,
    Address,
    Bytes,
    Filter,
    Log,
    TransactionReceipt,
    H256,
    U256,
};
use relayer_types::RelayerError;

#[async_trait]
pub trait EthNode: Send + Sync {
    async fn block_number(&self) -> Result<u64, RelayerError>;

    async fn chain_id(&self) -> Result<u64, RelayerError>;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RelayerError>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RelayerError>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, RelayerError>;

    async fn gas_price(&self) -> Result<U256, RelayerError>;

    async fn nonce_at(&self, address: Address) -> Result<U256, RelayerError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RelayerError>;

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RelayerError>;
}
