//! Scripted in-memory NEAR node: fixed block/chunk layouts, chunk-missing
//! injection, and decoding of submitted transactions so tests can assert on
//! the actual function calls.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::Engine as _;
use borsh::BorshDeserialize;
use near_primitives::transaction::{Action, SignedTransaction};
use parking_lot::Mutex;
use relayer_types::{Chain, RelayerError};
use serde_json::Value;

use crate::ports::{
    BlockView,
    ChunkHeaderView,
    ChunkTransactionView,
    ChunkView,
    NearRpc,
    NodeStatus,
    ReceiptOutcome,
    TxOutcome,
};

/// A decoded `FunctionCall` action captured from a submitted transaction.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub args: Value,
    pub deposit: u128,
    pub nonce: u64,
}

#[derive(Debug, Default)]
struct MockData {
    latest_height: u64,
    access_key_nonce: u64,
    access_key_fetches: u64,
    blocks: HashMap<u64, BlockView>,
    chunks: HashMap<String, ChunkView>,
    missing_chunks: Vec<String>,
    tx_outcomes: HashMap<String, TxOutcome>,
    view_responses: HashMap<String, Vec<u8>>,
    function_calls: Vec<CapturedCall>,
    next_success_value: Option<String>,
    fail_next_execution: Option<String>,
    fail_block_final: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MockNearNode {
    data: Arc<Mutex<MockData>>,
}

impl MockNearNode {
    pub fn set_latest_height(&self, height: u64) {
        let mut data = self.data.lock();
        data.latest_height = height;
        // The head must exist as a block for listeners that fetch it.
        let hash = block_hash(height);
        data.blocks.entry(height).or_insert(BlockView {
            height,
            hash,
            chunks: vec![],
        });
    }

    pub fn set_access_key_nonce(&self, nonce: u64) {
        self.data.lock().access_key_nonce = nonce;
    }

    /// Register a block with one chunk holding the given transactions.
    pub fn add_block_with_txs(&self, height: u64, txs: Vec<ChunkTransactionView>) {
        let chunk_hash = format!("chunk-{height}");
        let mut data = self.data.lock();
        data.blocks.insert(
            height,
            BlockView {
                height,
                hash: block_hash(height),
                chunks: vec![ChunkHeaderView {
                    chunk_hash: chunk_hash.clone(),
                    height_included: height,
                }],
            },
        );
        data.chunks.insert(chunk_hash, ChunkView { transactions: txs });
    }

    pub fn set_tx_logs(&self, tx_hash: &str, receipt_logs: Vec<Vec<String>>) {
        let outcome = TxOutcome {
            success_value: None,
            failure: None,
            receipts: receipt_logs
                .into_iter()
                .map(|logs| ReceiptOutcome { logs })
                .collect(),
        };
        self.data.lock().tx_outcomes.insert(tx_hash.to_string(), outcome);
    }

    /// Make the chunk of the block at `height` temporarily missing.
    pub fn make_chunk_missing(&self, height: u64) {
        self.data.lock().missing_chunks.push(format!("chunk-{height}"));
    }

    pub fn restore_chunk(&self, height: u64) {
        let hash = format!("chunk-{height}");
        self.data.lock().missing_chunks.retain(|c| c != &hash);
    }

    pub fn respond_to_view(&self, method: &str, response: Value) {
        self.data
            .lock()
            .view_responses
            .insert(method.to_string(), serde_json::to_vec(&response).unwrap());
    }

    pub fn respond_with_success_value(&self, value: Value) {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&value).unwrap());
        self.data.lock().next_success_value = Some(encoded);
    }

    pub fn fail_next_execution(&self, reason: &str) {
        self.data.lock().fail_next_execution = Some(reason.to_string());
    }

    pub fn fail_block_final_times(&self, n: u32) {
        self.data.lock().fail_block_final = n;
    }

    pub fn function_calls(&self) -> Vec<CapturedCall> {
        self.data.lock().function_calls.clone()
    }

    pub fn access_key_fetches(&self) -> u64 {
        self.data.lock().access_key_fetches
    }
}

fn block_hash(height: u64) -> String {
    // A deterministic but parseable base58 hash.
    bs58_encode(height)
}

fn bs58_encode(height: u64) -> String {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    near_primitives::hash::CryptoHash(bytes).to_string()
}

fn network(operation: &'static str, reason: &str) -> RelayerError {
    RelayerError::network(Chain::Near, operation, reason)
}

#[async_trait]
impl NearRpc for MockNearNode {
    async fn status(&self) -> Result<NodeStatus, RelayerError> {
        let data = self.data.lock();
        Ok(NodeStatus {
            chain_id: "mocknet".into(),
            latest_height: data.latest_height,
            latest_block_hash: block_hash(data.latest_height),
        })
    }

    async fn block_final(&self) -> Result<BlockView, RelayerError> {
        let mut data = self.data.lock();
        if data.fail_block_final > 0 {
            data.fail_block_final -= 1;
            return Err(network("block", "injected failure"));
        }
        let height = data.latest_height;
        data.blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| network("block", "no scripted head"))
    }

    async fn block_at(&self, height: u64) -> Result<Option<BlockView>, RelayerError> {
        Ok(self.data.lock().blocks.get(&height).cloned())
    }

    async fn chunk(&self, chunk_hash: &str) -> Result<Option<ChunkView>, RelayerError> {
        let data = self.data.lock();
        if data.missing_chunks.iter().any(|c| c == chunk_hash) {
            return Ok(None);
        }
        Ok(data.chunks.get(chunk_hash).cloned())
    }

    async fn view_function(
        &self,
        _contract: &str,
        method: &str,
        _args: Value,
    ) -> Result<Vec<u8>, RelayerError> {
        self.data
            .lock()
            .view_responses
            .get(method)
            .cloned()
            .ok_or_else(|| network("query", "no scripted view response"))
    }

    async fn access_key_nonce(
        &self,
        _account: &str,
        _public_key: &str,
    ) -> Result<u64, RelayerError> {
        let mut data = self.data.lock();
        data.access_key_fetches += 1;
        Ok(data.access_key_nonce)
    }

    async fn send_tx(&self, signed_tx_base64: String) -> Result<TxOutcome, RelayerError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&signed_tx_base64)
            .map_err(|e| network("send_tx", &e.to_string()))?;
        let signed = SignedTransaction::try_from_slice(&bytes)
            .map_err(|e| network("send_tx", &e.to_string()))?;

        let mut data = self.data.lock();
        let nonce = signed.transaction.nonce();
        for action in signed.transaction.actions() {
            if let Action::FunctionCall(call) = action {
                data.function_calls.push(CapturedCall {
                    method: call.method_name.clone(),
                    args: serde_json::from_slice(&call.args).unwrap_or(Value::Null),
                    deposit: call.deposit,
                    nonce,
                });
            }
        }

        if let Some(reason) = data.fail_next_execution.take() {
            return Ok(TxOutcome {
                success_value: None,
                failure: Some(reason),
                receipts: vec![],
            });
        }
        Ok(TxOutcome {
            success_value: data.next_success_value.clone(),
            failure: None,
            receipts: vec![],
        })
    }

    async fn tx_status(&self, tx_hash: &str, _sender: &str) -> Result<TxOutcome, RelayerError> {
        self.data
            .lock()
            .tx_outcomes
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| network("tx", "no scripted outcome"))
    }
}
