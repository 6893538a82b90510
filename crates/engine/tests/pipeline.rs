//! End-to-end pipeline tests: scripted chain nodes drive the real
//! supervisor, listeners, executor, coordinator and store.

use std::time::Duration;

use ethers_core::abi::Token;
use ethers_core::types::{Address, H256, U256, U64};
use relayer_engine::{Config, Supervisor, SupervisorConfig};
use relayer_eth::test_helpers::{logs, MockEthNode};
use relayer_near::test_helpers::MockNearNode;
use relayer_types::{Chain, Direction, MessageId, Secret, SwapStatus};
use serde_json::json;

const ETH_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
const DAY: u64 = 86_400;

fn bridge() -> Address {
    Address::repeat_byte(0xb0)
}

fn factory() -> Address {
    Address::repeat_byte(0xf0)
}

fn near_key() -> String {
    near_crypto::SecretKey::from_seed(near_crypto::KeyType::ED25519, "relayer-test").to_string()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn test_config(storage_dir: &str) -> Config {
    let raw = format!(
        r#"{{
            "near": {{
                "networkId": "mocknet",
                "nodeUrl": "http://127.0.0.1:3030",
                "accountId": "relayer.testnet",
                "privateKey": "{}",
                "escrowContractId": "escrow.testnet"
            }},
            "ethereum": {{
                "network": {{
                    "name": "mock",
                    "rpcUrl": "http://127.0.0.1:8545",
                    "chainId": 11155111,
                    "blockConfirmations": 1
                }},
                "privateKey": "{ETH_KEY}",
                "escrowContractAddress": "0x{}",
                "bridgeContractAddress": "0x{}",
                "escrowFactoryAddress": "0x{}"
            }},
            "relayer": {{
                "pollingInterval": 1000,
                "batchSize": 100,
                "storageDir": "{storage_dir}"
            }}
        }}"#,
        near_key(),
        hex::encode(Address::repeat_byte(0xe5)),
        hex::encode(bridge()),
        hex::encode(factory()),
    );
    let config = Config::from_json(&raw).unwrap();
    config.validate().unwrap();
    config
}

/// Mine mock Ethereum blocks so receipt confirmation depths are reached.
fn spawn_chain_progress(node: MockEthNode) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            node.advance_block();
        }
    })
}

async fn wait_for_status(
    store: &relayer_storage::StoreHandle,
    key: &MessageId,
    status: SwapStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    loop {
        if let Some(swap) = store.get(key).await.unwrap() {
            if swap.status == status {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "swap {key} never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn find_swap_by_direction(
    store: &relayer_storage::StoreHandle,
    direction: Direction,
) -> MessageId {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    loop {
        let swaps = store.all().await.unwrap();
        if let Some(swap) = swaps.iter().find(|swap| swap.direction == direction) {
            return swap.message_id.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no {direction} swap observed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn happy_eth_to_near_swap_settles_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let secret = Secret::new([42u8; 32]);
    let hashlock = secret.digest();
    let timelock_source = unix_now() + 7 * DAY;

    // A finalized user deposit on Ethereum.
    let eth_node = MockEthNode::default();
    eth_node.set_chain_id(11155111);
    eth_node.set_best_block(100);
    eth_node.set_nonce(0);
    eth_node.set_gas_estimate(100_000);
    let mut deposit = logs::deposit_initiated(
        H256::repeat_byte(0xd1),
        Address::repeat_byte(0xaa),
        "alice.near",
        U256::from(10_000_000_000_000_000u64),
        U256::one(),
        unix_now(),
    );
    deposit.address = bridge();
    deposit.block_number = Some(U64::from(80));
    deposit.transaction_hash = Some(H256::repeat_byte(0x21));
    deposit.log_index = Some(U256::zero());
    eth_node.push_log(deposit);
    eth_node.respond_to_call(
        bridge(),
        "getDeposit(bytes32)",
        vec![
            Token::FixedBytes(hashlock.as_bytes().to_vec()),
            Token::Uint(U256::from(timelock_source)),
            Token::Bool(false),
        ],
    );

    let near_node = MockNearNode::default();
    near_node.set_latest_height(10);
    near_node.set_access_key_nonce(1);
    near_node.respond_to_view("find_order_by_hashlock", json!(null));
    near_node.respond_with_success_value(json!(17));

    let config = test_config("storage");
    let supervisor = Supervisor::start(
        config,
        SupervisorConfig {
            project_root: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(30),
            watch_config_path: None,
        },
        eth_node.clone(),
        near_node.clone(),
    )
    .await
    .unwrap();
    let store = supervisor.store().clone();
    let progress = spawn_chain_progress(eth_node.clone());

    // The deposit is observed and mirrored into a NEAR order.
    let key = find_swap_by_direction(&store, Direction::EthToNear).await;
    wait_for_status(&store, &key, SwapStatus::AwaitingSettlement).await;
    let calls = near_node.function_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "create_swap_order");
    assert_eq!(calls[0].args["recipient"], "alice.near");
    // The mirrored deposit carries the rescaled value.
    assert_eq!(calls[0].deposit, 10_000_000_000_000_000_000_000);

    // The recipient fulfills the order, revealing the preimage.
    near_node.add_block_with_txs(
        20,
        vec![relayer_near::ports::ChunkTransactionView {
            hash: "TxFulfill".into(),
            signer_id: "alice.testnet".into(),
            receiver_id: "escrow.testnet".into(),
        }],
    );
    near_node.set_tx_logs(
        "TxFulfill",
        vec![vec![format!(
            "Fulfilled swap order 17 with secret {}",
            secret.expose_hex()
        )]],
    );
    near_node.set_latest_height(21);

    wait_for_status(&store, &key, SwapStatus::Settled).await;

    // Exactly one Ethereum withdrawal was submitted, with the secret.
    let sent = eth_node.sent_transactions();
    assert_eq!(sent.len(), 1);
    let calldata = sent[0].data().unwrap();
    assert!(calldata
        .windows(32)
        .any(|window| window == &secret.as_bytes()[..]));

    // A replay of the fulfillment event triggers nothing further.
    near_node.add_block_with_txs(
        30,
        vec![relayer_near::ports::ChunkTransactionView {
            hash: "TxFulfill2".into(),
            signer_id: "alice.testnet".into(),
            receiver_id: "escrow.testnet".into(),
        }],
    );
    near_node.set_tx_logs(
        "TxFulfill2",
        vec![vec![format!(
            "Fulfilled swap order 17 with secret {}",
            secret.expose_hex()
        )]],
    );
    near_node.set_latest_height(31);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(eth_node.sent_transactions().len(), 1);

    // The swap is terminal in the processed set, and the record kept.
    assert!(store.is_processed(&key).await.unwrap());
    let swap = store.get(&key).await.unwrap().unwrap();
    assert!(swap.secret.unwrap().matches(&swap.secret_hash));

    progress.abort();
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn happy_near_to_eth_swap_settles() {
    let dir = tempfile::tempdir().unwrap();
    let secret = Secret::new([43u8; 32]);
    let hashlock = secret.digest();
    let timelock_source = unix_now() + 7 * DAY;
    let escrow = Address::repeat_byte(0xec);

    // A NEAR-side deposit: someone locked 0.5 NEAR for an ETH recipient.
    let near_node = MockNearNode::default();
    near_node.set_access_key_nonce(1);
    near_node.add_block_with_txs(
        10,
        vec![relayer_near::ports::ChunkTransactionView {
            hash: "TxCreate".into(),
            signer_id: "bob.testnet".into(),
            receiver_id: "escrow.testnet".into(),
        }],
    );
    near_node.set_tx_logs(
        "TxCreate",
        vec![vec![
            "Created swap order 5 for 500000000000000000000000 yoctoNEAR to recipient 0x742d35cc6634c0532925a3b844bc454e4438f44e"
                .to_string(),
        ]],
    );
    near_node.respond_to_view(
        "get_order",
        json!({
            "id": 5,
            "maker": "bob.testnet",
            "recipient": "0x742d35cc6634c0532925a3b844bc454e4438f44e",
            "amount": "500000000000000000000000",
            "hashlock": hex::encode(hashlock.as_bytes()),
            "timelock": timelock_source,
            "status": "active",
        }),
    );
    near_node.respond_with_success_value(json!(null));
    near_node.set_latest_height(11);

    let eth_node = MockEthNode::default();
    eth_node.set_chain_id(11155111);
    eth_node.set_best_block(100);
    eth_node.set_nonce(0);
    eth_node.set_gas_estimate(200_000);
    eth_node.respond_to_call(
        factory(),
        "escrowByHashlock(bytes32)",
        vec![Token::Address(Address::zero())],
    );
    eth_node.emit_escrow_created_on_next_receipt(escrow);

    let config = test_config("storage");
    let supervisor = Supervisor::start(
        config,
        SupervisorConfig {
            project_root: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(30),
            watch_config_path: None,
        },
        eth_node.clone(),
        near_node.clone(),
    )
    .await
    .unwrap();
    let store = supervisor.store().clone();
    let progress = spawn_chain_progress(eth_node.clone());

    // The order is observed and mirrored into an Ethereum escrow.
    let key = find_swap_by_direction(&store, Direction::NearToEth).await;
    wait_for_status(&store, &key, SwapStatus::AwaitingSettlement).await;
    let swap = store.get(&key).await.unwrap().unwrap();
    assert_eq!(
        swap.escrow_ref,
        Some(relayer_types::EscrowRef::Eth(format!("{escrow:#x}")))
    );
    assert_eq!(eth_node.sent_transactions().len(), 1);

    // The ETH recipient withdraws from the escrow, revealing the secret on
    // Ethereum; the bridge reports the completed withdrawal.
    let current_head = {
        // Give the withdrawal event a comfortably finalized block.
        let head = 400;
        eth_node.set_best_block(head);
        head
    };
    let mut deposit_id_bytes = [0u8; 32];
    deposit_id_bytes[12..].copy_from_slice(escrow.as_bytes());
    let mut withdrawal = logs::withdrawal_completed(
        H256::from(deposit_id_bytes),
        Address::repeat_byte(0x42),
        U256::from(500_000_000_000_000_000u64),
        unix_now(),
    );
    withdrawal.address = bridge();
    withdrawal.block_number = Some(U64::from(current_head - 50));
    withdrawal.transaction_hash = Some(H256::repeat_byte(0x31));
    withdrawal.log_index = Some(U256::zero());
    eth_node.push_log(withdrawal);
    eth_node.respond_to_call(
        bridge(),
        "getRevealedSecret(bytes32)",
        vec![Token::FixedBytes(secret.as_bytes().to_vec())],
    );

    wait_for_status(&store, &key, SwapStatus::Settled).await;

    // The secret was propagated to NEAR with a single fulfill call.
    let fulfills: Vec<_> = near_node
        .function_calls()
        .into_iter()
        .filter(|call| call.method == "fulfill_order")
        .collect();
    assert_eq!(fulfills.len(), 1);
    assert_eq!(fulfills[0].args["order_id"], 5);
    assert_eq!(fulfills[0].args["secret"], secret.expose_hex());

    progress.abort();
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unsafe_timelock_is_rejected_with_no_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let secret = Secret::new([44u8; 32]);

    let eth_node = MockEthNode::default();
    eth_node.set_chain_id(11155111);
    eth_node.set_best_block(100);
    let mut deposit = logs::deposit_initiated(
        H256::repeat_byte(0xd2),
        Address::repeat_byte(0xaa),
        "alice.near",
        U256::from(10_000_000_000_000_000u64),
        U256::one(),
        unix_now(),
    );
    deposit.address = bridge();
    deposit.block_number = Some(U64::from(80));
    deposit.transaction_hash = Some(H256::repeat_byte(0x22));
    deposit.log_index = Some(U256::zero());
    eth_node.push_log(deposit);
    // Only 30 seconds of timelock headroom.
    eth_node.respond_to_call(
        bridge(),
        "getDeposit(bytes32)",
        vec![
            Token::FixedBytes(secret.digest().as_bytes().to_vec()),
            Token::Uint(U256::from(unix_now() + 30)),
            Token::Bool(false),
        ],
    );

    let near_node = MockNearNode::default();
    near_node.set_latest_height(10);

    let config = test_config("storage");
    let supervisor = Supervisor::start(
        config,
        SupervisorConfig {
            project_root: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(30),
            watch_config_path: None,
        },
        eth_node.clone(),
        near_node.clone(),
    )
    .await
    .unwrap();
    let store = supervisor.store().clone();

    let key = find_swap_by_direction(&store, Direction::EthToNear).await;
    wait_for_status(&store, &key, SwapStatus::Failed).await;

    let swap = store.get(&key).await.unwrap().unwrap();
    assert_eq!(swap.last_error.unwrap().kind, "security");
    // No mirror escrow was created and no transaction submitted anywhere.
    assert!(near_node.function_calls().is_empty());
    assert!(eth_node.sent_transactions().is_empty());
    assert!(swap.escrow_ref.is_none());

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_from_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let secret = Secret::new([45u8; 32]);
    let hashlock = secret.digest();
    let timelock_source = unix_now() + 7 * DAY;

    let eth_node = MockEthNode::default();
    eth_node.set_chain_id(11155111);
    eth_node.set_best_block(100);
    let mut deposit = logs::deposit_initiated(
        H256::repeat_byte(0xd3),
        Address::repeat_byte(0xaa),
        "alice.near",
        U256::from(10_000_000_000_000_000u64),
        U256::one(),
        unix_now(),
    );
    deposit.address = bridge();
    deposit.block_number = Some(U64::from(80));
    deposit.transaction_hash = Some(H256::repeat_byte(0x23));
    deposit.log_index = Some(U256::zero());
    eth_node.push_log(deposit);
    eth_node.respond_to_call(
        bridge(),
        "getDeposit(bytes32)",
        vec![
            Token::FixedBytes(hashlock.as_bytes().to_vec()),
            Token::Uint(U256::from(timelock_source)),
            Token::Bool(false),
        ],
    );

    let near_node = MockNearNode::default();
    near_node.set_latest_height(10);
    near_node.set_access_key_nonce(1);
    near_node.respond_to_view("find_order_by_hashlock", json!(null));
    near_node.respond_with_success_value(json!(17));

    let config = test_config("storage");
    let supervisor = Supervisor::start(
        config.clone(),
        SupervisorConfig {
            project_root: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(30),
            watch_config_path: None,
        },
        eth_node.clone(),
        near_node.clone(),
    )
    .await
    .unwrap();
    let store = supervisor.store().clone();

    let key = find_swap_by_direction(&store, Direction::EthToNear).await;
    wait_for_status(&store, &key, SwapStatus::AwaitingSettlement).await;
    supervisor.shutdown().await.unwrap();
    drop(store);

    // Restart over the same storage. The mirror already exists on chain;
    // reconciliation must not create a second one.
    let supervisor = Supervisor::start(
        config,
        SupervisorConfig {
            project_root: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(30),
            watch_config_path: None,
        },
        eth_node.clone(),
        near_node.clone(),
    )
    .await
    .unwrap();
    let store = supervisor.store().clone();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let swap = store.get(&key).await.unwrap().unwrap();
    assert_eq!(swap.status, SwapStatus::AwaitingSettlement);
    assert_eq!(
        near_node
            .function_calls()
            .iter()
            .filter(|call| call.method == "create_swap_order")
            .count(),
        1
    );
    // The Ethereum cursor survived the restart.
    assert!(store.cursor(Chain::Ethereum).await.unwrap().unwrap() >= 80);

    supervisor.shutdown().await.unwrap();
}
