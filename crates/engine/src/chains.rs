//! Port implementations over the real chain adapters. These are the only
//! places where the coordinator's domain-typed world meets ethers and NEAR
//! primitives.

use async_trait::async_trait;
use ethers_core::types::{Address, H256};
use relayer_eth::{EthAdapter, EthNode};
use relayer_near::{NearAdapter, NearRpc, OrderStatus};
use relayer_types::{Amount, RelayerError, Secret, SecretHash};

use crate::ports::{DepositState, EthHome, MirrorState, NearHome};

fn parse_h256(value: &str, field: &'static str) -> Result<H256, RelayerError> {
    value
        .parse()
        .map_err(|_| RelayerError::validation(field, format!("not a 32-byte hex value: {value}")))
}

fn parse_address(value: &str, field: &'static str) -> Result<Address, RelayerError> {
    value
        .parse()
        .map_err(|_| RelayerError::validation(field, format!("not an address: {value}")))
}

#[async_trait]
impl<N: EthNode + 'static> EthHome for EthAdapter<N> {
    async fn deposit_state(&self, deposit_id: &str) -> Result<DepositState, RelayerError> {
        let deposit = self
            .get_deposit(parse_h256(deposit_id, "deposit_id")?)
            .await?;
        Ok(DepositState {
            withdrawn: deposit.withdrawn,
            timelock: deposit.timelock,
        })
    }

    async fn escrow_state(&self, escrow: &str) -> Result<MirrorState, RelayerError> {
        let status = self
            .escrow_status(parse_address(escrow, "escrow")?)
            .await?;
        Ok(MirrorState {
            settled: status.settled,
            refunded: status.refunded,
            timelock: status.timelock,
        })
    }

    async fn complete_withdrawal(
        &self,
        deposit_id: &str,
        secret: &Secret,
    ) -> Result<(), RelayerError> {
        // The unlocked funds go to the operator key that funded the mirror.
        let recipient = self.signer_address();
        self.complete_withdrawal(parse_h256(deposit_id, "deposit_id")?, recipient, secret)
            .await?;
        Ok(())
    }

    async fn create_escrow(
        &self,
        amount: &Amount,
        secret_hash: &SecretHash,
        timelock: u64,
        initiator: &str,
        recipient: &str,
    ) -> Result<String, RelayerError> {
        let (escrow, _receipt) = self
            .create_escrow(
                Address::zero(),
                amount.as_wei()?,
                secret_hash,
                timelock,
                initiator,
                parse_address(recipient, "recipient")?,
            )
            .await?;
        Ok(format!("{escrow:#x}"))
    }

    async fn refund_escrow(&self, escrow: &str) -> Result<(), RelayerError> {
        self.refund_escrow(parse_address(escrow, "escrow")?).await?;
        Ok(())
    }

    async fn find_escrow_by_hashlock(
        &self,
        hashlock: &SecretHash,
    ) -> Result<Option<String>, RelayerError> {
        Ok(self
            .escrow_by_hashlock(hashlock)
            .await?
            .map(|escrow| format!("{escrow:#x}")))
    }
}

#[async_trait]
impl<R: NearRpc + 'static> NearHome for NearAdapter<R> {
    async fn order_state(&self, order_id: u64) -> Result<Option<MirrorState>, RelayerError> {
        Ok(self.get_order(order_id).await?.map(|order| MirrorState {
            settled: order.status == OrderStatus::Fulfilled,
            refunded: order.status == OrderStatus::Refunded,
            timelock: order.timelock,
        }))
    }

    async fn create_order(
        &self,
        recipient: &str,
        secret_hash: &SecretHash,
        timelock_duration_secs: u64,
        amount: &Amount,
    ) -> Result<u64, RelayerError> {
        let (order_id, _outcome) = self
            .create_swap_order(recipient, secret_hash, timelock_duration_secs, amount.as_yocto()?)
            .await?;
        Ok(order_id)
    }

    async fn fulfill_order(&self, order_id: u64, secret: &Secret) -> Result<(), RelayerError> {
        NearAdapter::fulfill_order(self, order_id, secret).await?;
        Ok(())
    }

    async fn refund_order(&self, order_id: u64) -> Result<(), RelayerError> {
        NearAdapter::refund_order(self, order_id).await?;
        Ok(())
    }

    async fn find_order_by_hashlock(
        &self,
        hashlock: &SecretHash,
    ) -> Result<Option<u64>, RelayerError> {
        NearAdapter::find_order_by_hashlock(self, hashlock).await
    }
}
