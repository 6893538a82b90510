//! Typed wrapper over the Ethereum node: transaction submission with gas and
//! confirmation policy, contract views, and mapping of provider failures into
//! the relayer's error taxonomy.

use std::time::Duration;

use ethers_core::{
    abi::{self, ParamType, Token},
    types::{
        transaction::eip2718::TypedTransaction,
        Address,
        Bytes,
        Filter,
        Log,
        TransactionReceipt,
        TransactionRequest,
        H256,
        U256,
    },
    utils::keccak256,
};
use ethers_signers::{LocalWallet, Signer};
use relayer_types::{Chain, ContractReason, RelayerError, Secret, SecretHash};

use crate::{log::ESCROW_CREATED_TOPIC, ports::EthNode};

const GAS_BUFFER_NUM: u64 = 120;
const GAS_BUFFER_DEN: u64 = 100;

#[derive(Debug, Clone)]
pub struct EthAdapterConfig {
    pub bridge: Address,
    pub factory: Address,
    pub chain_id: u64,
    /// Confirmations a receipt must age before a submission counts as done.
    pub receipt_confirmations: u64,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub max_gas_price: Option<U256>,
}

impl Default for EthAdapterConfig {
    fn default() -> Self {
        Self {
            bridge: Address::zero(),
            factory: Address::zero(),
            chain_id: 1,
            receipt_confirmations: 2,
            receipt_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_secs(3),
            max_gas_price: None,
        }
    }
}

/// On-chain state of a factory-created escrow, read before acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowStatus {
    pub settled: bool,
    pub refunded: bool,
    pub timelock: u64,
}

/// `getDeposit` view of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositView {
    pub hashlock: SecretHash,
    pub timelock: u64,
    pub withdrawn: bool,
}

#[derive(Debug)]
pub struct EthAdapter<N> {
    node: N,
    wallet: LocalWallet,
    config: EthAdapterConfig,
    /// Cached next nonce, advanced under this single-writer lock and
    /// invalidated when the chain disagrees.
    nonce: tokio::sync::Mutex<Option<U256>>,
}

impl<N: EthNode> EthAdapter<N> {
    pub fn new(node: N, private_key: &str, config: EthAdapterConfig) -> Result<Self, RelayerError> {
        let key = private_key.strip_prefix("0x").unwrap_or(private_key);
        let wallet: LocalWallet = key
            .parse()
            .map_err(|_| RelayerError::validation("ethereum.privateKey", "not a valid secp256k1 key"))?;
        let wallet = wallet.with_chain_id(config.chain_id);
        Ok(Self {
            node,
            wallet,
            config,
            nonce: tokio::sync::Mutex::new(None),
        })
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn config(&self) -> &EthAdapterConfig {
        &self.config
    }

    pub fn signer_address(&self) -> Address {
        self.wallet.address()
    }

    pub async fn get_block_number(&self) -> Result<u64, RelayerError> {
        self.node.block_number().await
    }

    pub async fn chain_id(&self) -> Result<u64, RelayerError> {
        self.node.chain_id().await
    }

    pub async fn get_logs(
        &self,
        addresses: Vec<Address>,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, RelayerError> {
        let filter = Filter::new().address(addresses).from_block(from).to_block(to);
        self.node.get_logs(&filter).await
    }

    /// Logs for one event class only, filtered server-side by topic0.
    pub async fn query_filter(
        &self,
        address: Address,
        topic0: H256,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, RelayerError> {
        let filter = Filter::new()
            .address(address)
            .topic0(topic0)
            .from_block(from)
            .to_block(to);
        self.node.get_logs(&filter).await
    }

    pub async fn call_view(&self, to: Address, data: Bytes) -> Result<Bytes, RelayerError> {
        self.node.call(to, data).await
    }

    /// Hashlock, timelock and withdrawal flag recorded for a deposit. The
    /// `DepositInitiated` event does not carry these, so the listener and
    /// the coordinator read them through this view.
    pub async fn get_deposit(&self, deposit_id: H256) -> Result<DepositView, RelayerError> {
        let data = encode_call(
            "getDeposit(bytes32)",
            &[Token::FixedBytes(deposit_id.as_bytes().to_vec())],
        );
        let raw = self.call_view(self.config.bridge, data).await?;
        let tokens = abi::decode(
            &[ParamType::FixedBytes(32), ParamType::Uint(256), ParamType::Bool],
            &raw,
        )
        .map_err(|_| self.invalid_return(self.config.bridge, "getDeposit"))?;
        let [Token::FixedBytes(hashlock), Token::Uint(timelock), Token::Bool(withdrawn)] =
            tokens.as_slice()
        else {
            return Err(self.invalid_return(self.config.bridge, "getDeposit"));
        };
        let hashlock: [u8; 32] = hashlock
            .as_slice()
            .try_into()
            .map_err(|_| self.invalid_return(self.config.bridge, "getDeposit"))?;
        if *timelock > U256::from(u64::MAX) {
            return Err(self.invalid_return(self.config.bridge, "getDeposit"));
        }
        Ok(DepositView {
            hashlock: SecretHash(hashlock),
            timelock: timelock.as_u64(),
            withdrawn: *withdrawn,
        })
    }

    /// The factory escrow created for a hashlock, if any. The zero address
    /// means none.
    pub async fn escrow_by_hashlock(
        &self,
        hashlock: &SecretHash,
    ) -> Result<Option<Address>, RelayerError> {
        let data = encode_call(
            "escrowByHashlock(bytes32)",
            &[Token::FixedBytes(hashlock.as_bytes().to_vec())],
        );
        let raw = self.call_view(self.config.factory, data).await?;
        let tokens = abi::decode(&[ParamType::Address], &raw)
            .map_err(|_| self.invalid_return(self.config.factory, "escrowByHashlock"))?;
        let [Token::Address(escrow)] = tokens.as_slice() else {
            return Err(self.invalid_return(self.config.factory, "escrowByHashlock"));
        };
        Ok((*escrow != Address::zero()).then_some(*escrow))
    }

    /// The preimage revealed by a completed withdrawal. `WithdrawalCompleted`
    /// does not carry it on the wire.
    pub async fn get_revealed_secret(&self, deposit_id: H256) -> Result<Secret, RelayerError> {
        let data = encode_call(
            "getRevealedSecret(bytes32)",
            &[Token::FixedBytes(deposit_id.as_bytes().to_vec())],
        );
        let raw = self.call_view(self.config.bridge, data).await?;
        let tokens = abi::decode(&[ParamType::FixedBytes(32)], &raw)
            .map_err(|_| self.invalid_return(self.config.bridge, "getRevealedSecret"))?;
        let [Token::FixedBytes(secret)] = tokens.as_slice() else {
            return Err(self.invalid_return(self.config.bridge, "getRevealedSecret"));
        };
        let secret: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| self.invalid_return(self.config.bridge, "getRevealedSecret"))?;
        if secret == [0u8; 32] {
            return Err(RelayerError::contract(
                format!("{:#x}", self.config.bridge),
                "getRevealedSecret",
                ContractReason::NotFound,
            ));
        }
        Ok(Secret::new(secret))
    }

    /// `status()` view of a factory-created escrow.
    pub async fn escrow_status(&self, escrow: Address) -> Result<EscrowStatus, RelayerError> {
        let data = encode_call("status()", &[]);
        let raw = self.call_view(escrow, data).await?;
        let tokens = abi::decode(
            &[ParamType::Bool, ParamType::Bool, ParamType::Uint(256)],
            &raw,
        )
        .map_err(|_| self.invalid_return(escrow, "status"))?;
        let [Token::Bool(settled), Token::Bool(refunded), Token::Uint(timelock)] =
            tokens.as_slice()
        else {
            return Err(self.invalid_return(escrow, "status"));
        };
        if *timelock > U256::from(u64::MAX) {
            return Err(self.invalid_return(escrow, "status"));
        }
        Ok(EscrowStatus {
            settled: *settled,
            refunded: *refunded,
            timelock: timelock.as_u64(),
        })
    }

    /// `completeWithdrawal` on the bridge, propagating the revealed secret
    /// back to the deposit side.
    pub async fn complete_withdrawal(
        &self,
        deposit_id: H256,
        recipient: Address,
        secret: &Secret,
    ) -> Result<TransactionReceipt, RelayerError> {
        let data = encode_call(
            "completeWithdrawal(bytes32,address,bytes32,bytes[])",
            &[
                Token::FixedBytes(deposit_id.as_bytes().to_vec()),
                Token::Address(recipient),
                Token::FixedBytes(secret.as_bytes().to_vec()),
                Token::Array(vec![]),
            ],
        );
        self.send_tx(self.config.bridge, data, U256::zero(), None, "completeWithdrawal")
            .await
    }

    /// Create the mirror escrow for a NEAR-side deposit. Returns the escrow
    /// address parsed from the receipt's `EscrowCreated` log.
    pub async fn create_escrow(
        &self,
        token: Address,
        amount: U256,
        secret_hash: &SecretHash,
        timelock: u64,
        initiator: &str,
        recipient: Address,
    ) -> Result<(Address, TransactionReceipt), RelayerError> {
        let data = encode_call(
            "createEscrow(address,uint256,bytes32,uint256,string,address,uint256)",
            &[
                Token::Address(token),
                Token::Uint(amount),
                Token::FixedBytes(secret_hash.as_bytes().to_vec()),
                Token::Uint(U256::from(timelock)),
                Token::String(initiator.to_string()),
                Token::Address(recipient),
                Token::Uint(U256::from(self.config.chain_id)),
            ],
        );
        // Native escrows carry the mirrored value with the creation call.
        let value = if token == Address::zero() { amount } else { U256::zero() };
        let receipt = self
            .send_tx(self.config.factory, data, value, None, "createEscrow")
            .await?;

        let escrow = receipt
            .logs
            .iter()
            .find(|log| log.topics.first() == Some(&*ESCROW_CREATED_TOPIC))
            .and_then(|log| log.topics.get(1))
            .map(|topic| Address::from_slice(&topic.as_bytes()[12..]))
            .ok_or_else(|| {
                RelayerError::contract(
                    format!("{:#x}", self.config.factory),
                    "createEscrow",
                    ContractReason::InvalidReturn,
                )
            })?;
        Ok((escrow, receipt))
    }

    /// Reclaim an expired escrow.
    pub async fn refund_escrow(&self, escrow: Address) -> Result<TransactionReceipt, RelayerError> {
        let data = encode_call("refund()", &[]);
        self.send_tx(escrow, data, U256::zero(), None, "refund").await
    }

    /// Sign and submit a transaction, then wait for its receipt to age to the
    /// configured confirmation depth.
    pub async fn send_tx(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        gas_hint: Option<U256>,
        method: &str,
    ) -> Result<TransactionReceipt, RelayerError> {
        let mut nonce_slot = self.nonce.lock().await;
        let nonce = match *nonce_slot {
            Some(nonce) => nonce,
            None => self.node.nonce_at(self.signer_address()).await?,
        };

        let mut gas_price = self.node.gas_price().await?;
        if let Some(cap) = self.config.max_gas_price {
            gas_price = gas_price.min(cap);
        }

        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(self.signer_address())
            .to(to)
            .value(value)
            .data(data)
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(self.config.chain_id)
            .into();

        let gas = match gas_hint {
            Some(gas) => gas,
            None => match self.node.estimate_gas(&tx).await {
                Ok(estimate) => {
                    estimate * U256::from(GAS_BUFFER_NUM) / U256::from(GAS_BUFFER_DEN)
                }
                Err(e) => {
                    tracing::debug!(error = %e, method, "gas estimation failed");
                    return Err(RelayerError::contract(
                        format!("{to:#x}"),
                        method,
                        ContractReason::UnpredictableGasLimit,
                    ));
                }
            },
        };
        tx.set_gas(gas);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::network(Chain::Ethereum, "sign_transaction", e))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = match self.node.send_raw_transaction(raw).await {
            Ok(hash) => hash,
            Err(e) => {
                let classified = classify_send_error(&e, to, method);
                if matches!(
                    classified,
                    RelayerError::Contract {
                        reason: ContractReason::NonceTooLow,
                        ..
                    }
                ) {
                    // The chain disagrees with our cache; refetch next time.
                    *nonce_slot = None;
                }
                return Err(classified);
            }
        };
        *nonce_slot = Some(nonce + U256::one());
        drop(nonce_slot);

        tracing::debug!(method, %tx_hash, nonce = nonce.as_u64(), "transaction submitted");
        self.wait_for_receipt(tx_hash, to, method).await
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        to: Address,
        method: &str,
    ) -> Result<TransactionReceipt, RelayerError> {
        let deadline = tokio::time::Instant::now() + self.config.receipt_timeout;
        loop {
            if let Some(receipt) = self.node.transaction_receipt(tx_hash).await? {
                if receipt.status == Some(0.into()) {
                    return Err(RelayerError::contract(
                        format!("{to:#x}"),
                        method,
                        ContractReason::Reverted {
                            tx_hash: Some(format!("{tx_hash:#x}")),
                        },
                    ));
                }
                let mined_at = receipt
                    .block_number
                    .map(|n| n.as_u64())
                    .unwrap_or(u64::MAX);
                let head = self.node.block_number().await?;
                if head >= mined_at.saturating_add(self.config.receipt_confirmations.saturating_sub(1)) {
                    return Ok(receipt);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RelayerError::contract(
                    format!("{to:#x}"),
                    method,
                    ContractReason::TimeoutWaitingForReceipt,
                ));
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    fn invalid_return(&self, address: Address, method: &str) -> RelayerError {
        RelayerError::contract(format!("{address:#x}"), method, ContractReason::InvalidReturn)
    }
}

/// Four-byte selector plus ABI-encoded arguments.
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let selector = &keccak256(signature.as_bytes())[0..4];
    let mut data = selector.to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

fn classify_send_error(error: &RelayerError, to: Address, method: &str) -> RelayerError {
    let text = error.to_string().to_lowercase();
    let reason = if text.contains("nonce too low") || text.contains("nonce is too low") {
        Some(ContractReason::NonceTooLow)
    } else if text.contains("underpriced") {
        Some(ContractReason::UnderpricedReplacement)
    } else if text.contains("revert") {
        Some(ContractReason::Reverted { tx_hash: None })
    } else {
        None
    };
    match reason {
        Some(reason) => RelayerError::contract(format!("{to:#x}"), method, reason),
        None => error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockEthNode;

    const TEST_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn adapter(node: MockEthNode) -> EthAdapter<MockEthNode> {
        EthAdapter::new(
            node,
            TEST_KEY,
            EthAdapterConfig {
                bridge: Address::repeat_byte(0xb0),
                factory: Address::repeat_byte(0xf0),
                chain_id: 11155111,
                receipt_confirmations: 1,
                receipt_poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_tx_buffers_gas_and_advances_the_nonce() {
        let node = MockEthNode::default();
        node.set_best_block(100);
        node.set_nonce(7);
        node.set_gas_estimate(100_000);
        let adapter = adapter(node.clone());

        adapter
            .send_tx(
                Address::repeat_byte(0x01),
                Bytes::from(vec![0x01]),
                U256::zero(),
                None,
                "test",
            )
            .await
            .unwrap();

        let sent = node.sent_transactions();
        assert_eq!(sent.len(), 1);
        // One nonce fetch, then the cache serves the next submission.
        adapter
            .send_tx(
                Address::repeat_byte(0x01),
                Bytes::from(vec![0x02]),
                U256::zero(),
                None,
                "test",
            )
            .await
            .unwrap();
        assert_eq!(node.nonce_fetches(), 1);

        let gas = node.last_gas().unwrap();
        assert_eq!(gas, U256::from(120_000u64));
    }

    #[tokio::test]
    async fn nonce_too_low_invalidates_the_cache() {
        let node = MockEthNode::default();
        node.set_best_block(100);
        node.set_nonce(3);
        node.fail_next_send("nonce too low");
        let adapter = adapter(node.clone());

        let err = adapter
            .send_tx(
                Address::repeat_byte(0x02),
                Bytes::default(),
                U256::zero(),
                Some(U256::from(21_000u64)),
                "test",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Contract {
                reason: ContractReason::NonceTooLow,
                ..
            }
        ));
        assert!(err.is_retryable());

        // The retry refetches the nonce.
        node.set_nonce(9);
        adapter
            .send_tx(
                Address::repeat_byte(0x02),
                Bytes::default(),
                U256::zero(),
                Some(U256::from(21_000u64)),
                "test",
            )
            .await
            .unwrap();
        assert_eq!(node.nonce_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_receipt_times_out_as_retryable() {
        let node = MockEthNode::default();
        node.set_best_block(100);
        node.set_nonce(0);
        node.suppress_receipts();
        let adapter = EthAdapter::new(
            node.clone(),
            TEST_KEY,
            EthAdapterConfig {
                receipt_confirmations: 1,
                receipt_timeout: Duration::from_millis(200),
                receipt_poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .unwrap();

        let err = adapter
            .send_tx(
                Address::repeat_byte(0x03),
                Bytes::default(),
                U256::zero(),
                Some(U256::from(21_000u64)),
                "test",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Contract {
                reason: ContractReason::TimeoutWaitingForReceipt,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reverted_receipt_is_terminal() {
        let node = MockEthNode::default();
        node.set_best_block(100);
        node.set_nonce(0);
        node.revert_next_tx();
        let adapter = adapter(node.clone());

        let err = adapter
            .send_tx(
                Address::repeat_byte(0x04),
                Bytes::default(),
                U256::zero(),
                Some(U256::from(21_000u64)),
                "test",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Contract {
                reason: ContractReason::Reverted { .. },
                ..
            }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn create_escrow_returns_the_address_from_the_receipt() {
        let node = MockEthNode::default();
        node.set_best_block(100);
        node.set_nonce(0);
        node.set_gas_estimate(200_000);
        let escrow = Address::repeat_byte(0xec);
        node.emit_escrow_created_on_next_receipt(escrow);
        let adapter = adapter(node.clone());

        let hash = Secret::new([5u8; 32]).digest();
        let (created, _receipt) = adapter
            .create_escrow(
                Address::zero(),
                U256::from(10_000u64),
                &hash,
                1_900_000_000,
                "bob.near",
                Address::repeat_byte(0xaa),
            )
            .await
            .unwrap();
        assert_eq!(created, escrow);
    }
}
