//! JSON-RPC 2.0 client for NEAR over HTTP. NEAR's error envelope is mapped
//! here: `UNKNOWN_CHUNK`/`UNKNOWN_BLOCK` become non-error `None` results,
//! transport failures become retryable network errors, and execution
//! failures become contract errors.

use std::time::Duration;

use async_trait::async_trait;
use relayer_types::{Chain, ContractReason, RelayerError};
use serde::Deserialize;
use serde_json::{json, Value};

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

#[derive(Debug, Clone)]
pub struct JsonRpcNearNode {
    client: reqwest::Client,
    url: String,
    rpc_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    cause: Option<RpcErrorCause>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcErrorCause {
    #[serde(default)]
    name: String,
}

enum RpcOutcome {
    Ok(Value),
    /// `UNKNOWN_CHUNK` / `UNKNOWN_BLOCK`: absent data, not a failure.
    Missing,
}

impl JsonRpcNearNode {
    pub fn connect(url: &str, rpc_timeout: Duration) -> Result<Self, RelayerError> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| RelayerError::network(Chain::Near, "connect", e))?;
        Ok(Self {
            client,
            url: url.to_string(),
            rpc_timeout,
        })
    }

    async fn request(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<RpcOutcome, RelayerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "relayer",
            "method": method,
            "params": params,
        });

        let send = self.client.post(&self.url).json(&body).send();
        let response = match tokio::time::timeout(self.rpc_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(RelayerError::network(Chain::Near, method, e)),
            Err(_) => {
                return Err(RelayerError::network(Chain::Near, method, "rpc deadline exceeded"))
            }
        };

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| RelayerError::network(Chain::Near, method, e))?;

        if let Some(error) = envelope.error {
            let cause = error.cause.map(|c| c.name).unwrap_or_default();
            if cause == "UNKNOWN_CHUNK" || cause == "UNKNOWN_BLOCK" {
                return Ok(RpcOutcome::Missing);
            }
            if error.name == "HANDLER_ERROR" {
                return Err(RelayerError::contract(
                    self.url.clone(),
                    method,
                    ContractReason::Reverted { tx_hash: None },
                ));
            }
            return Err(RelayerError::network(
                Chain::Near,
                method,
                format!("{} {}: {}", error.name, cause, error.message),
            ));
        }
        envelope
            .result
            .map(RpcOutcome::Ok)
            .ok_or_else(|| RelayerError::network(Chain::Near, method, "empty rpc response"))
    }

    async fn request_value(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Value, RelayerError> {
        match self.request(method, params).await? {
            RpcOutcome::Ok(value) => Ok(value),
            RpcOutcome::Missing => Err(RelayerError::network(
                Chain::Near,
                method,
                "unexpected missing response",
            )),
        }
    }
}

fn invalid_view(method: &'static str, detail: impl std::fmt::Display) -> RelayerError {
    RelayerError::network(Chain::Near, method, format!("undecodable view: {detail}"))
}

fn block_from_value(value: &Value, method: &'static str) -> Result<BlockView, RelayerError> {
    let header = value
        .get("header")
        .ok_or_else(|| invalid_view(method, "missing header"))?;
    let height = header
        .get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid_view(method, "missing height"))?;
    let hash = header
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_view(method, "missing hash"))?
        .to_string();
    let chunks = value
        .get("chunks")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid_view(method, "missing chunks"))?
        .iter()
        .map(|chunk| {
            Ok(ChunkHeaderView {
                chunk_hash: chunk
                    .get("chunk_hash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_view(method, "missing chunk_hash"))?
                    .to_string(),
                height_included: chunk
                    .get("height_included")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| invalid_view(method, "missing height_included"))?,
            })
        })
        .collect::<Result<Vec<_>, RelayerError>>()?;
    Ok(BlockView {
        height,
        hash,
        chunks,
    })
}

fn outcome_from_value(value: &Value, method: &'static str) -> Result<TxOutcome, RelayerError> {
    let status = value
        .get("status")
        .ok_or_else(|| invalid_view(method, "missing status"))?;
    let success_value = status
        .get("SuccessValue")
        .and_then(Value::as_str)
        .map(str::to_string);
    let failure = status.get("Failure").map(|f| f.to_string());

    let no_receipts = Vec::new();
    let receipts = value
        .get("receipts_outcome")
        .and_then(Value::as_array)
        .unwrap_or(&no_receipts)
        .iter()
        .map(|receipt| {
            let logs = receipt
                .pointer("/outcome/logs")
                .and_then(Value::as_array)
                .map(|logs| {
                    logs.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            ReceiptOutcome { logs }
        })
        .collect();

    Ok(TxOutcome {
        success_value,
        failure,
        receipts,
    })
}

#[async_trait]
impl NearRpc for JsonRpcNearNode {
    async fn status(&self) -> Result<NodeStatus, RelayerError> {
        let value = self.request_value("status", json!([])).await?;
        let chain_id = value
            .get("chain_id")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_view("status", "missing chain_id"))?
            .to_string();
        let latest_height = value
            .pointer("/sync_info/latest_block_height")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid_view("status", "missing latest_block_height"))?;
        let latest_block_hash = value
            .pointer("/sync_info/latest_block_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_view("status", "missing latest_block_hash"))?
            .to_string();
        Ok(NodeStatus {
            chain_id,
            latest_height,
            latest_block_hash,
        })
    }

    async fn block_final(&self) -> Result<BlockView, RelayerError> {
        let value = self
            .request_value("block", json!({"finality": "final"}))
            .await?;
        block_from_value(&value, "block")
    }

    async fn block_at(&self, height: u64) -> Result<Option<BlockView>, RelayerError> {
        match self.request("block", json!({"block_id": height})).await? {
            RpcOutcome::Ok(value) => Ok(Some(block_from_value(&value, "block")?)),
            RpcOutcome::Missing => Ok(None),
        }
    }

    async fn chunk(&self, chunk_hash: &str) -> Result<Option<ChunkView>, RelayerError> {
        match self
            .request("chunk", json!({"chunk_id": chunk_hash}))
            .await?
        {
            RpcOutcome::Missing => Ok(None),
            RpcOutcome::Ok(value) => {
                let transactions = value
                    .get("transactions")
                    .and_then(Value::as_array)
                    .ok_or_else(|| invalid_view("chunk", "missing transactions"))?
                    .iter()
                    .map(|tx| {
                        let field = |name: &str| {
                            tx.get(name)
                                .and_then(Value::as_str)
                                .map(str::to_string)
                                .ok_or_else(|| invalid_view("chunk", format!("missing {name}")))
                        };
                        Ok(ChunkTransactionView {
                            hash: field("hash")?,
                            signer_id: field("signer_id")?,
                            receiver_id: field("receiver_id")?,
                        })
                    })
                    .collect::<Result<Vec<_>, RelayerError>>()?;
                Ok(Some(ChunkView { transactions }))
            }
        }
    }

    async fn view_function(
        &self,
        contract: &str,
        method: &str,
        args: Value,
    ) -> Result<Vec<u8>, RelayerError> {
        use base64::Engine as _;
        let args_base64 =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&args).unwrap_or_default());
        let value = self
            .request_value(
                "query",
                json!({
                    "request_type": "call_function",
                    "finality": "final",
                    "account_id": contract,
                    "method_name": method,
                    "args_base64": args_base64,
                }),
            )
            .await?;
        let bytes = value
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid_view("query", "missing result bytes"))?
            .iter()
            .map(|b| {
                b.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| invalid_view("query", "non-byte in result"))
            })
            .collect::<Result<Vec<u8>, RelayerError>>()?;
        Ok(bytes)
    }

    async fn access_key_nonce(
        &self,
        account: &str,
        public_key: &str,
    ) -> Result<u64, RelayerError> {
        let value = self
            .request_value(
                "query",
                json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": account,
                    "public_key": public_key,
                }),
            )
            .await?;
        value
            .get("nonce")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid_view("query", "missing access key nonce"))
    }

    async fn send_tx(&self, signed_tx_base64: String) -> Result<TxOutcome, RelayerError> {
        let value = self
            .request_value(
                "send_tx",
                json!({
                    "signed_tx_base64": signed_tx_base64,
                    "wait_until": "FINAL",
                }),
            )
            .await?;
        outcome_from_value(&value, "send_tx")
    }

    async fn tx_status(&self, tx_hash: &str, sender: &str) -> Result<TxOutcome, RelayerError> {
        let value = self
            .request_value(
                "tx",
                json!({
                    "tx_hash": tx_hash,
                    "sender_account_id": sender,
                    "wait_until": "FINAL",
                }),
            )
            .await?;
        outcome_from_value(&value, "tx")
    }
}
