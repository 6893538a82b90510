//! Typed wrapper over the NEAR node: escrow function calls with locally
//! signed transactions, contract views, and `SuccessValue` decoding.

use std::str::FromStr;

use base64::Engine as _;
use near_crypto::{InMemorySigner, SecretKey, Signer};
use near_primitives::{
    hash::CryptoHash,
    transaction::{Action, FunctionCallAction, SignedTransaction, Transaction, TransactionV0},
    types::AccountId,
};
use relayer_types::{Chain, ContractReason, RelayerError, Secret, SecretHash};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::ports::{NearRpc, NodeStatus, TxOutcome};

/// 300 TGas, enough for every escrow method including its callbacks.
const FUNCTION_CALL_GAS: u64 = 300_000_000_000_000;

#[derive(Debug, Clone)]
pub struct NearAdapterConfig {
    pub network_id: String,
    pub escrow_contract: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Active,
    Fulfilled,
    Refunded,
}

/// `get_order` view of the escrow contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub id: u64,
    pub maker: String,
    pub recipient: String,
    #[serde(with = "u128_dec")]
    pub amount: u128,
    /// Hex digest the order is locked to.
    pub hashlock: String,
    /// Absolute unix-seconds deadline.
    pub timelock: u64,
    pub status: OrderStatus,
}

mod u128_dec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub struct NearAdapter<R> {
    rpc: R,
    signer: Signer,
    account_id: AccountId,
    escrow: AccountId,
    nonce: tokio::sync::Mutex<Option<u64>>,
}

impl<R: NearRpc> NearAdapter<R> {
    pub fn new(rpc: R, private_key: &str, config: NearAdapterConfig) -> Result<Self, RelayerError> {
        let account_id = AccountId::from_str(&config.account_id)
            .map_err(|e| RelayerError::validation("near.accountId", e.to_string()))?;
        let escrow = AccountId::from_str(&config.escrow_contract)
            .map_err(|e| RelayerError::validation("near.escrowContractId", e.to_string()))?;
        let secret_key = SecretKey::from_str(private_key)
            .map_err(|_| RelayerError::validation("near.privateKey", "not a valid ed25519 key"))?;
        let signer = InMemorySigner::from_secret_key(account_id.clone(), secret_key);
        Ok(Self {
            rpc,
            signer,
            account_id,
            escrow,
            nonce: tokio::sync::Mutex::new(None),
        })
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn escrow_contract(&self) -> &AccountId {
        &self.escrow
    }

    pub async fn status(&self) -> Result<NodeStatus, RelayerError> {
        self.rpc.status().await
    }

    /// Decoded contract view. `call_function` failures and undecodable
    /// results both surface as contract errors.
    pub async fn view<T: DeserializeOwned>(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<T, RelayerError> {
        let bytes = self
            .rpc
            .view_function(self.escrow.as_str(), method, args)
            .await?;
        serde_json::from_slice(&bytes).map_err(|_| {
            RelayerError::contract(self.escrow.to_string(), method, ContractReason::InvalidReturn)
        })
    }

    pub async fn get_order(&self, order_id: u64) -> Result<Option<OrderView>, RelayerError> {
        self.view("get_order", json!({ "order_id": order_id })).await
    }

    /// The order already locked to a hashlock, if any.
    pub async fn find_order_by_hashlock(
        &self,
        hashlock: &SecretHash,
    ) -> Result<Option<u64>, RelayerError> {
        self.view(
            "find_order_by_hashlock",
            json!({ "hashlock": hex::encode(hashlock.as_bytes()) }),
        )
        .await
    }

    /// Create the mirror order for an Ethereum-side deposit, attaching the
    /// mirrored value. Returns the order id from the contract's return
    /// value.
    pub async fn create_swap_order(
        &self,
        recipient: &str,
        hashlock: &SecretHash,
        timelock_duration_secs: u64,
        deposit_yocto: u128,
    ) -> Result<(u64, TxOutcome), RelayerError> {
        let args = json!({
            "recipient": recipient,
            "hashlock": hex::encode(hashlock.as_bytes()),
            "timelock_duration": timelock_duration_secs,
        });
        let outcome = self
            .function_call("create_swap_order", args, deposit_yocto)
            .await?;
        let order_id: u64 = self.decode_success_value(&outcome, "create_swap_order")?;
        Ok((order_id, outcome))
    }

    pub async fn fulfill_order(
        &self,
        order_id: u64,
        secret: &Secret,
    ) -> Result<TxOutcome, RelayerError> {
        let args = json!({ "order_id": order_id, "secret": secret.expose_hex() });
        self.function_call("fulfill_order", args, 0).await
    }

    pub async fn refund_order(&self, order_id: u64) -> Result<TxOutcome, RelayerError> {
        self.function_call("refund_order", json!({ "order_id": order_id }), 0)
            .await
    }

    async fn function_call(
        &self,
        method: &str,
        args: serde_json::Value,
        deposit_yocto: u128,
    ) -> Result<TxOutcome, RelayerError> {
        let mut nonce_slot = self.nonce.lock().await;
        let nonce = match *nonce_slot {
            Some(nonce) => nonce + 1,
            None => {
                let current = self
                    .rpc
                    .access_key_nonce(
                        self.account_id.as_str(),
                        &self.signer.public_key().to_string(),
                    )
                    .await?;
                current + 1
            }
        };

        let block = self.rpc.block_final().await?;
        let block_hash = CryptoHash::from_str(&block.hash).map_err(|e| {
            RelayerError::network(Chain::Near, "block", format!("bad block hash: {e}"))
        })?;

        let action = Action::FunctionCall(Box::new(FunctionCallAction {
            method_name: method.to_string(),
            args: serde_json::to_vec(&args)
                .map_err(|e| RelayerError::validation("args", e.to_string()))?,
            gas: FUNCTION_CALL_GAS,
            deposit: deposit_yocto,
        }));
        let transaction = Transaction::V0(TransactionV0 {
            signer_id: self.account_id.clone(),
            public_key: self.signer.public_key(),
            nonce,
            receiver_id: self.escrow.clone(),
            block_hash,
            actions: vec![action],
        });

        let (hash, _size) = transaction.get_hash_and_size();
        let signature = self.signer.sign(hash.as_ref());
        let signed = SignedTransaction::new(signature, transaction);
        let bytes = borsh::to_vec(&signed)
            .map_err(|e| RelayerError::validation("transaction", e.to_string()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

        let outcome = match self.rpc.send_tx(encoded).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.to_string().to_lowercase().contains("invalidnonce") {
                    *nonce_slot = None;
                    return Err(RelayerError::contract(
                        self.escrow.to_string(),
                        method,
                        ContractReason::NonceTooLow,
                    ));
                }
                return Err(e);
            }
        };
        *nonce_slot = Some(nonce);
        drop(nonce_slot);

        if let Some(failure) = &outcome.failure {
            tracing::debug!(method, failure, "near function call failed");
            return Err(RelayerError::contract(
                self.escrow.to_string(),
                method,
                ContractReason::Reverted { tx_hash: None },
            ));
        }
        Ok(outcome)
    }

    /// Base64-decode and JSON-decode a `SuccessValue`.
    fn decode_success_value<T: DeserializeOwned>(
        &self,
        outcome: &TxOutcome,
        method: &str,
    ) -> Result<T, RelayerError> {
        let invalid = || {
            RelayerError::contract(self.escrow.to_string(), method, ContractReason::InvalidReturn)
        };
        let encoded = outcome.success_value.as_ref().ok_or_else(invalid)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| invalid())?;
        serde_json::from_slice(&bytes).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockNearNode;

    fn test_key() -> String {
        near_crypto::SecretKey::from_seed(near_crypto::KeyType::ED25519, "relayer-test").to_string()
    }

    fn adapter(node: MockNearNode) -> NearAdapter<MockNearNode> {
        NearAdapter::new(
            node,
            &test_key(),
            NearAdapterConfig {
                network_id: "testnet".into(),
                escrow_contract: "escrow.testnet".into(),
                account_id: "relayer.testnet".into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_swap_order_attaches_the_deposit_and_decodes_the_id() {
        let node = MockNearNode::default();
        node.set_latest_height(500);
        node.set_access_key_nonce(41);
        node.respond_with_success_value(serde_json::json!(17));

        let adapter = adapter(node.clone());
        let hashlock = Secret::new([2u8; 32]).digest();
        let (order_id, _outcome) = adapter
            .create_swap_order("alice.near", &hashlock, 86_400, 1_000_000)
            .await
            .unwrap();
        assert_eq!(order_id, 17);

        let calls = node.function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "create_swap_order");
        assert_eq!(calls[0].deposit, 1_000_000);
        assert_eq!(calls[0].args["recipient"], "alice.near");
        // Nonce is the access key nonce + 1.
        assert_eq!(calls[0].nonce, 42);
    }

    #[tokio::test]
    async fn nonce_is_cached_between_calls() {
        let node = MockNearNode::default();
        node.set_latest_height(500);
        node.set_access_key_nonce(7);
        node.respond_with_success_value(serde_json::json!(null));

        let adapter = adapter(node.clone());
        let secret = Secret::new([3u8; 32]);
        adapter.fulfill_order(1, &secret).await.unwrap();
        adapter.fulfill_order(2, &secret).await.unwrap();

        let calls = node.function_calls();
        assert_eq!(calls[0].nonce, 8);
        assert_eq!(calls[1].nonce, 9);
        assert_eq!(node.access_key_fetches(), 1);
    }

    #[tokio::test]
    async fn execution_failure_is_a_contract_error() {
        let node = MockNearNode::default();
        node.set_latest_height(500);
        node.fail_next_execution("order already fulfilled");

        let adapter = adapter(node.clone());
        let err = adapter.refund_order(1).await.unwrap_err();
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
    async fn undecodable_success_value_is_invalid_return() {
        let node = MockNearNode::default();
        node.set_latest_height(500);
        node.respond_with_success_value(serde_json::json!("not a number"));

        let adapter = adapter(node.clone());
        let hashlock = Secret::new([2u8; 32]).digest();
        let err = adapter
            .create_swap_order("alice.near", &hashlock, 60, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Contract {
                reason: ContractReason::InvalidReturn,
                ..
            }
        ));
    }
}
