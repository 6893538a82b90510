//! Scripted in-memory Ethereum node for tests: fixed block heights, injected
//! log batches, and failure injection for the submission path.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ethers_core::{
    abi::{self, Token},
    types::{
        transaction::eip2718::TypedTransaction,
        Address,
        Bytes,
        Filter,
        Log,
        TransactionReceipt,
        H256,
        U256,
        U64,
    },
    utils::keccak256,
};
use parking_lot::Mutex;
use relayer_types::{Chain, RelayerError};

use crate::ports::EthNode;

#[derive(Debug, Default)]
struct MockData {
    best_block: u64,
    chain_id: u64,
    nonce: u64,
    nonce_fetches: u64,
    gas_estimate: u64,
    gas_price: u64,
    logs: Vec<Log>,
    sent: Vec<TypedTransaction>,
    receipts: HashMap<H256, TransactionReceipt>,
    call_responses: HashMap<(Address, [u8; 4]), Bytes>,
    fail_next_send: Option<String>,
    fail_get_logs: u32,
    suppress_receipts: bool,
    revert_next: bool,
    next_receipt_logs: Vec<Log>,
}

#[derive(Debug, Clone, Default)]
pub struct MockEthNode {
    data: Arc<Mutex<MockData>>,
}

impl MockEthNode {
    pub fn set_best_block(&self, height: u64) {
        self.data.lock().best_block = height;
    }

    pub fn advance_block(&self) {
        self.data.lock().best_block += 1;
    }

    pub fn set_chain_id(&self, id: u64) {
        self.data.lock().chain_id = id;
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.data.lock().nonce = nonce;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.data.lock().gas_estimate = gas;
    }

    pub fn push_log(&self, log: Log) {
        self.data.lock().logs.push(log);
    }

    pub fn fail_next_send(&self, reason: &str) {
        self.data.lock().fail_next_send = Some(reason.to_string());
    }

    /// Make the next `n` `get_logs` calls fail with a network error.
    pub fn fail_get_logs_times(&self, n: u32) {
        self.data.lock().fail_get_logs = n;
    }

    pub fn suppress_receipts(&self) {
        self.data.lock().suppress_receipts = true;
    }

    pub fn revert_next_tx(&self) {
        self.data.lock().revert_next = true;
    }

    pub fn emit_escrow_created_on_next_receipt(&self, escrow: Address) {
        let log = logs::escrow_created(
            escrow,
            Address::zero(),
            U256::zero(),
            "near",
            "unused.near",
        );
        self.data.lock().next_receipt_logs.push(log);
    }

    /// Script the response of an `eth_call` to `method_signature` on `to`.
    pub fn respond_to_call(&self, to: Address, method_signature: &str, response: Vec<Token>) {
        let selector: [u8; 4] = keccak256(method_signature.as_bytes())[0..4]
            .try_into()
            .unwrap();
        self.data
            .lock()
            .call_responses
            .insert((to, selector), Bytes::from(abi::encode(&response)));
    }

    pub fn sent_transactions(&self) -> Vec<TypedTransaction> {
        self.data.lock().sent.clone()
    }

    pub fn nonce_fetches(&self) -> u64 {
        self.data.lock().nonce_fetches
    }

    pub fn last_gas(&self) -> Option<U256> {
        self.data.lock().sent.last().and_then(|tx| tx.gas().copied())
    }
}

fn network(operation: &'static str, reason: &str) -> RelayerError {
    RelayerError::network(Chain::Ethereum, operation, reason)
}

#[async_trait]
impl EthNode for MockEthNode {
    async fn block_number(&self) -> Result<u64, RelayerError> {
        Ok(self.data.lock().best_block)
    }

    async fn chain_id(&self) -> Result<u64, RelayerError> {
        Ok(self.data.lock().chain_id)
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RelayerError> {
        let mut data = self.data.lock();
        if data.fail_get_logs > 0 {
            data.fail_get_logs -= 1;
            return Err(network("get_logs", "injected failure"));
        }

        let (from, to) = match filter.block_option {
            ethers_core::types::FilterBlockOption::Range {
                from_block,
                to_block,
            } => (
                from_block.and_then(|b| b.as_number()).map(|n| n.as_u64()),
                to_block.and_then(|b| b.as_number()).map(|n| n.as_u64()),
            ),
            _ => (None, None),
        };
        let addresses: Option<Vec<Address>> = filter.address.clone().map(|a| match a {
            ethers_core::types::ValueOrArray::Value(v) => vec![v],
            ethers_core::types::ValueOrArray::Array(v) => v,
        });

        Ok(data
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.map(|n| n.as_u64()).unwrap_or(0);
                from.map_or(true, |f| block >= f)
                    && to.map_or(true, |t| block <= t)
                    && addresses
                        .as_ref()
                        .map_or(true, |addrs| addrs.contains(&log.address))
            })
            .cloned()
            .collect())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RelayerError> {
        let selector: [u8; 4] = data
            .get(0..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| network("call", "malformed calldata"))?;
        self.data
            .lock()
            .call_responses
            .get(&(to, selector))
            .cloned()
            .ok_or_else(|| network("call", "no scripted response"))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, RelayerError> {
        Ok(U256::from(self.data.lock().gas_estimate))
    }

    async fn gas_price(&self) -> Result<U256, RelayerError> {
        Ok(U256::from(self.data.lock().gas_price.max(1_000_000_000)))
    }

    async fn nonce_at(&self, _address: Address) -> Result<U256, RelayerError> {
        let mut data = self.data.lock();
        data.nonce_fetches += 1;
        Ok(U256::from(data.nonce))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RelayerError> {
        let mut data = self.data.lock();
        if let Some(reason) = data.fail_next_send.take() {
            return Err(network("send_raw_transaction", &reason));
        }

        let rlp = ethers_core::utils::rlp::Rlp::new(raw.as_ref());
        let (tx, _signature) = TypedTransaction::decode_signed(&rlp)
            .map_err(|e| network("send_raw_transaction", &e.to_string()))?;
        data.sent.push(tx);

        let hash = H256::from(keccak256(raw.as_ref()));
        let status = if std::mem::take(&mut data.revert_next) {
            0u64
        } else {
            1u64
        };
        let receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(data.best_block)),
            status: Some(U64::from(status)),
            logs: std::mem::take(&mut data.next_receipt_logs),
            ..Default::default()
        };
        data.receipts.insert(hash, receipt);
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RelayerError> {
        let data = self.data.lock();
        if data.suppress_receipts {
            return Ok(None);
        }
        Ok(data.receipts.get(&hash).cloned())
    }
}

/// Wire-exact log constructors for the consumed events. Tests set `address`,
/// `block_number`, `transaction_hash` and `log_index` as needed.
pub mod logs {
    use super::*;
    use crate::log::{
        DEPOSIT_INITIATED_TOPIC,
        ESCROW_CREATED_TOPIC,
        MESSAGE_SENT_TOPIC,
        WITHDRAWAL_COMPLETED_TOPIC,
    };

    fn base(topics: Vec<H256>, data: Vec<Token>) -> Log {
        Log {
            topics,
            data: Bytes::from(abi::encode(&data)),
            ..Default::default()
        }
    }

    fn address_topic(address: Address) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(address.as_bytes());
        H256::from(bytes)
    }

    pub fn deposit_initiated(
        deposit_id: H256,
        sender: Address,
        near_recipient: &str,
        amount: U256,
        fee: U256,
        timestamp: u64,
    ) -> Log {
        base(
            vec![*DEPOSIT_INITIATED_TOPIC, deposit_id, address_topic(sender)],
            vec![
                Token::String(near_recipient.to_string()),
                Token::Address(Address::zero()),
                Token::Uint(amount),
                Token::Uint(fee),
                Token::Uint(U256::from(timestamp)),
            ],
        )
    }

    pub fn message_sent(
        message_ref: H256,
        deposit_id: H256,
        sender: Address,
        near_recipient: &str,
        amount: U256,
        timestamp: u64,
    ) -> Log {
        base(
            vec![
                *MESSAGE_SENT_TOPIC,
                message_ref,
                deposit_id,
                address_topic(sender),
            ],
            vec![
                Token::String(near_recipient.to_string()),
                Token::Uint(amount),
                Token::Uint(U256::from(timestamp)),
            ],
        )
    }

    pub fn withdrawal_completed(
        deposit_id: H256,
        recipient: Address,
        amount: U256,
        timestamp: u64,
    ) -> Log {
        base(
            vec![
                *WITHDRAWAL_COMPLETED_TOPIC,
                deposit_id,
                address_topic(recipient),
            ],
            vec![Token::Uint(amount), Token::Uint(U256::from(timestamp))],
        )
    }

    pub fn escrow_created(
        escrow: Address,
        initiator: Address,
        amount: U256,
        target_chain: &str,
        target_address: &str,
    ) -> Log {
        base(
            vec![
                *ESCROW_CREATED_TOPIC,
                address_topic(escrow),
                address_topic(initiator),
            ],
            vec![
                Token::Address(Address::zero()),
                Token::Uint(amount),
                Token::String(target_chain.to_string()),
                Token::String(target_address.to_string()),
            ],
        )
    }
}
