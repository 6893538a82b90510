//! Strict decoding of the bridge and factory events the relayer consumes.
//!
//! Unknown topics are ignored; a log whose topic0 matches a known event but
//! whose body does not decode is an error, and the listener refuses to
//! advance past it.

use std::sync::LazyLock;

use ethers_core::{
    abi::{self, ParamType, Token},
    types::{Address, Log, H256, U256},
    utils::keccak256,
};
use relayer_types::RelayerError;

pub const DEPOSIT_INITIATED_SIG: &str =
    "DepositInitiated(bytes32,address,string,address,uint256,uint256,uint256)";
pub const MESSAGE_SENT_SIG: &str = "MessageSent(bytes32,bytes32,address,string,uint256,uint256)";
pub const WITHDRAWAL_COMPLETED_SIG: &str = "WithdrawalCompleted(bytes32,address,uint256,uint256)";
pub const ESCROW_CREATED_SIG: &str = "EscrowCreated(address,address,address,uint256,string,string)";

pub static DEPOSIT_INITIATED_TOPIC: LazyLock<H256> =
    LazyLock::new(|| H256::from(keccak256(DEPOSIT_INITIATED_SIG)));
pub static MESSAGE_SENT_TOPIC: LazyLock<H256> =
    LazyLock::new(|| H256::from(keccak256(MESSAGE_SENT_SIG)));
pub static WITHDRAWAL_COMPLETED_TOPIC: LazyLock<H256> =
    LazyLock::new(|| H256::from(keccak256(WITHDRAWAL_COMPLETED_SIG)));
pub static ESCROW_CREATED_TOPIC: LazyLock<H256> =
    LazyLock::new(|| H256::from(keccak256(ESCROW_CREATED_SIG)));

/// A bridge/factory event with its wire payload decoded, before enrichment
/// into a normalized [`relayer_types::ChainEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEthLog {
    DepositInitiated {
        deposit_id: H256,
        sender: Address,
        near_recipient: String,
        token: Address,
        amount: U256,
        fee: U256,
        timestamp: u64,
    },
    MessageSent {
        message_ref: H256,
        deposit_id: H256,
        sender: Address,
        near_recipient: String,
        amount: U256,
        timestamp: u64,
    },
    WithdrawalCompleted {
        deposit_id: H256,
        recipient: Address,
        amount: U256,
        timestamp: u64,
    },
    EscrowCreated {
        escrow: Address,
        initiator: Address,
        token: Address,
        amount: U256,
        target_chain: String,
        target_address: String,
    },
}

fn malformed(event: &str, detail: impl std::fmt::Display) -> RelayerError {
    RelayerError::validation("eth_log", format!("{event}: {detail}"))
}

fn address_from_topic(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

fn u256_to_u64(value: U256, event: &str, field: &str) -> Result<u64, RelayerError> {
    if value > U256::from(u64::MAX) {
        return Err(malformed(event, format!("{field} out of u64 range")));
    }
    Ok(value.as_u64())
}

fn topic(log: &Log, index: usize, event: &str) -> Result<H256, RelayerError> {
    log.topics
        .get(index)
        .copied()
        .ok_or_else(|| malformed(event, format!("missing topic {index}")))
}

fn decode_body(
    log: &Log,
    params: &[ParamType],
    event: &str,
) -> Result<Vec<Token>, RelayerError> {
    abi::decode(params, &log.data).map_err(|e| malformed(event, e))
}

/// Decode one raw log. `Ok(None)` for topics the relayer does not consume.
pub fn decode_log(log: &Log) -> Result<Option<DecodedEthLog>, RelayerError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };

    if topic0 == &*DEPOSIT_INITIATED_TOPIC {
        let event = "DepositInitiated";
        let body = decode_body(
            log,
            &[
                ParamType::String,
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            event,
        )?;
        let [Token::String(near_recipient), Token::Address(token), Token::Uint(amount), Token::Uint(fee), Token::Uint(timestamp)] =
            body.as_slice()
        else {
            return Err(malformed(event, "unexpected token shape"));
        };
        Ok(Some(DecodedEthLog::DepositInitiated {
            deposit_id: topic(log, 1, event)?,
            sender: address_from_topic(&topic(log, 2, event)?),
            near_recipient: near_recipient.clone(),
            token: *token,
            amount: *amount,
            fee: *fee,
            timestamp: u256_to_u64(*timestamp, event, "timestamp")?,
        }))
    } else if topic0 == &*MESSAGE_SENT_TOPIC {
        let event = "MessageSent";
        let body = decode_body(
            log,
            &[ParamType::String, ParamType::Uint(256), ParamType::Uint(256)],
            event,
        )?;
        let [Token::String(near_recipient), Token::Uint(amount), Token::Uint(timestamp)] =
            body.as_slice()
        else {
            return Err(malformed(event, "unexpected token shape"));
        };
        Ok(Some(DecodedEthLog::MessageSent {
            message_ref: topic(log, 1, event)?,
            deposit_id: topic(log, 2, event)?,
            sender: address_from_topic(&topic(log, 3, event)?),
            near_recipient: near_recipient.clone(),
            amount: *amount,
            timestamp: u256_to_u64(*timestamp, event, "timestamp")?,
        }))
    } else if topic0 == &*WITHDRAWAL_COMPLETED_TOPIC {
        let event = "WithdrawalCompleted";
        let body = decode_body(log, &[ParamType::Uint(256), ParamType::Uint(256)], event)?;
        let [Token::Uint(amount), Token::Uint(timestamp)] = body.as_slice() else {
            return Err(malformed(event, "unexpected token shape"));
        };
        Ok(Some(DecodedEthLog::WithdrawalCompleted {
            deposit_id: topic(log, 1, event)?,
            recipient: address_from_topic(&topic(log, 2, event)?),
            amount: *amount,
            timestamp: u256_to_u64(*timestamp, event, "timestamp")?,
        }))
    } else if topic0 == &*ESCROW_CREATED_TOPIC {
        let event = "EscrowCreated";
        let body = decode_body(
            log,
            &[
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::String,
                ParamType::String,
            ],
            event,
        )?;
        let [Token::Address(token), Token::Uint(amount), Token::String(target_chain), Token::String(target_address)] =
            body.as_slice()
        else {
            return Err(malformed(event, "unexpected token shape"));
        };
        Ok(Some(DecodedEthLog::EscrowCreated {
            escrow: address_from_topic(&topic(log, 1, event)?),
            initiator: address_from_topic(&topic(log, 2, event)?),
            token: *token,
            amount: *amount,
            target_chain: target_chain.clone(),
            target_address: target_address.clone(),
        }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::logs;

    #[test]
    fn decodes_a_deposit_event() {
        let log = logs::deposit_initiated(
            H256::repeat_byte(0xd1),
            Address::repeat_byte(0xaa),
            "alice.near",
            U256::from(10_000_000_000_000_000u64),
            U256::from(1u64),
            1_900_000_000,
        );
        let decoded = decode_log(&log).unwrap().unwrap();
        match decoded {
            DecodedEthLog::DepositInitiated {
                deposit_id,
                sender,
                near_recipient,
                amount,
                fee,
                timestamp,
                ..
            } => {
                assert_eq!(deposit_id, H256::repeat_byte(0xd1));
                assert_eq!(sender, Address::repeat_byte(0xaa));
                assert_eq!(near_recipient, "alice.near");
                assert_eq!(amount, U256::from(10_000_000_000_000_000u64));
                assert_eq!(fee, U256::from(1u64));
                assert_eq!(timestamp, 1_900_000_000);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_withdrawal_and_escrow_created() {
        let log = logs::withdrawal_completed(
            H256::repeat_byte(0xd2),
            Address::repeat_byte(0xbb),
            U256::from(5u64),
            1_900_000_100,
        );
        assert!(matches!(
            decode_log(&log).unwrap().unwrap(),
            DecodedEthLog::WithdrawalCompleted { .. }
        ));

        let log = logs::escrow_created(
            Address::repeat_byte(0xec),
            Address::repeat_byte(0xcc),
            U256::from(7u64),
            "near",
            "bob.near",
        );
        match decode_log(&log).unwrap().unwrap() {
            DecodedEthLog::EscrowCreated {
                escrow,
                target_chain,
                target_address,
                ..
            } => {
                assert_eq!(escrow, Address::repeat_byte(0xec));
                assert_eq!(target_chain, "near");
                assert_eq!(target_address, "bob.near");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_topics_are_ignored() {
        let mut log = Log::default();
        log.topics = vec![H256::repeat_byte(0xff)];
        assert_eq!(decode_log(&log).unwrap(), None);
    }

    #[test]
    fn malformed_body_on_a_known_topic_is_an_error() {
        let mut log = logs::withdrawal_completed(
            H256::repeat_byte(0xd2),
            Address::repeat_byte(0xbb),
            U256::from(5u64),
            1_900_000_100,
        );
        log.data = ethers_core::types::Bytes::from(vec![0x01, 0x02]);
        assert!(decode_log(&log).is_err());
    }
}
