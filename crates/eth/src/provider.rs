use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::{
    transaction::eip2718::TypedTransaction,
    Address,
    BlockNumber,
    Bytes,
    Filter,
    Log,
    TransactionReceipt,
    H256,
    U256,
};
use ethers_providers::{Http, Middleware, Provider};
use relayer_types::{Chain, RelayerError};

use crate::ports::EthNode;

/// [`EthNode`] over an HTTP JSON-RPC provider. Every call carries its own
/// deadline; exceeding it is a retryable network error, not a cancellation.
#[derive(Debug, Clone)]
pub struct JsonRpcEthNode {
    provider: Provider<Http>,
    rpc_timeout: Duration,
}

impl JsonRpcEthNode {
    pub fn connect(rpc_url: &str, rpc_timeout: Duration) -> Result<Self, RelayerError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| RelayerError::network(Chain::Ethereum, "connect", e))?;
        Ok(Self {
            provider,
            rpc_timeout,
        })
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, fut: F) -> Result<T, RelayerError>
    where
        F: std::future::Future<Output = Result<T, ethers_providers::ProviderError>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RelayerError::network(Chain::Ethereum, operation, e)),
            Err(_) => Err(RelayerError::network(
                Chain::Ethereum,
                operation,
                "rpc deadline exceeded",
            )),
        }
    }
}

#[async_trait]
impl EthNode for JsonRpcEthNode {
    async fn block_number(&self) -> Result<u64, RelayerError> {
        let number = self
            .with_deadline("get_block_number", self.provider.get_block_number())
            .await?;
        Ok(number.as_u64())
    }

    async fn chain_id(&self) -> Result<u64, RelayerError> {
        let id = self
            .with_deadline("chain_id", self.provider.get_chainid())
            .await?;
        Ok(id.as_u64())
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RelayerError> {
        self.with_deadline("get_logs", self.provider.get_logs(filter))
            .await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RelayerError> {
        let tx: TypedTransaction = ethers_core::types::TransactionRequest::new()
            .to(to)
            .data(data)
            .into();
        self.with_deadline("call", self.provider.call(&tx, None))
            .await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, RelayerError> {
        self.with_deadline("estimate_gas", self.provider.estimate_gas(tx, None))
            .await
    }

    async fn gas_price(&self) -> Result<U256, RelayerError> {
        self.with_deadline("gas_price", self.provider.get_gas_price())
            .await
    }

    async fn nonce_at(&self, address: Address) -> Result<U256, RelayerError> {
        self.with_deadline(
            "get_transaction_count",
            self.provider
                .get_transaction_count(address, Some(BlockNumber::Pending.into())),
        )
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RelayerError> {
        match tokio::time::timeout(self.rpc_timeout, self.provider.send_raw_transaction(raw)).await
        {
            Ok(Ok(pending)) => Ok(pending.tx_hash()),
            Ok(Err(e)) => Err(RelayerError::network(
                Chain::Ethereum,
                "send_raw_transaction",
                e,
            )),
            Err(_) => Err(RelayerError::network(
                Chain::Ethereum,
                "send_raw_transaction",
                "rpc deadline exceeded",
            )),
        }
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RelayerError> {
        self.with_deadline(
            "get_transaction_receipt",
            self.provider.get_transaction_receipt(hash),
        )
        .await
    }
}
