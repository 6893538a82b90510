//! The error taxonomy shared by every relayer component.
//!
//! Adapters raise the primitive kinds; coordinators recover or surface them;
//! the retry layer consults [`RelayerError::is_retryable`] so retry decisions
//! stay auditable in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two chains this relayer bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Ethereum,
    Near,
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Ethereum => f.write_str("ethereum"),
            Chain::Near => f.write_str("near"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityIssue {
    #[error("path escapes the configured storage root")]
    PathEscape,
    #[error("file name contains characters outside [A-Za-z0-9_.-]")]
    UnsafeFilename,
    #[error("timelock safety margin violated")]
    UnsafeTimelock,
    #[error("revealed preimage does not hash to the committed hashlock")]
    PreimageMismatch,
}

/// Failure reasons reported by a contract interaction. Only a subset is
/// retryable; see [`RelayerError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractReason {
    /// Receipt came back with status 0.
    Reverted { tx_hash: Option<String> },
    TimeoutWaitingForReceipt,
    NonceTooLow,
    UnderpricedReplacement,
    UnpredictableGasLimit,
    /// The call succeeded but its return value could not be decoded.
    InvalidReturn,
    NotFound,
}

impl std::fmt::Display for ContractReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractReason::Reverted { tx_hash: Some(hash) } => {
                write!(f, "transaction reverted ({hash})")
            }
            ContractReason::Reverted { tx_hash: None } => f.write_str("transaction reverted"),
            ContractReason::TimeoutWaitingForReceipt => {
                f.write_str("timed out waiting for the receipt")
            }
            ContractReason::NonceTooLow => f.write_str("nonce too low"),
            ContractReason::UnderpricedReplacement => f.write_str("replacement underpriced"),
            ContractReason::UnpredictableGasLimit => f.write_str("gas limit estimation failed"),
            ContractReason::InvalidReturn => f.write_str("undecodable return value"),
            ContractReason::NotFound => f.write_str("not found"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOperation {
    Load,
    Persist,
    Begin,
    Transition,
}

impl std::fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageOperation::Load => f.write_str("load"),
            StorageOperation::Persist => f.write_str("persist"),
            StorageOperation::Begin => f.write_str("begin"),
            StorageOperation::Transition => f.write_str("transition"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigIssue {
    #[error("{0}")]
    Invalid(String),
    #[error("cannot be changed without a process restart")]
    UnsafeHotReload,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayerError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("security violation: {0}")]
    Security(#[from] SecurityIssue),

    #[error("{chain} network error during {operation}: {reason}")]
    Network {
        chain: Chain,
        operation: &'static str,
        reason: String,
    },

    #[error("contract call {method} on {address} failed: {reason}")]
    Contract {
        address: String,
        method: String,
        reason: ContractReason,
    },

    #[error("storage {operation} failed for {path}: {reason}")]
    Storage {
        operation: StorageOperation,
        path: String,
        reason: String,
    },

    #[error("configuration error for {key}: {issue}")]
    Configuration { key: String, issue: ConfigIssue },
}

impl RelayerError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        RelayerError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn network(chain: Chain, operation: &'static str, reason: impl std::fmt::Display) -> Self {
        RelayerError::Network {
            chain,
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn contract(
        address: impl Into<String>,
        method: impl Into<String>,
        reason: ContractReason,
    ) -> Self {
        RelayerError::Contract {
            address: address.into(),
            method: method.into(),
            reason,
        }
    }

    /// Type-directed retry disposition. Network failures retry, validation and
    /// security failures never do, contract failures retry only for the known
    /// transient reasons.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::Network { .. } => true,
            RelayerError::Contract { reason, .. } => matches!(
                reason,
                ContractReason::NonceTooLow
                    | ContractReason::UnderpricedReplacement
                    | ContractReason::UnpredictableGasLimit
                    | ContractReason::TimeoutWaitingForReceipt
            ),
            RelayerError::Validation { .. }
            | RelayerError::Security(_)
            | RelayerError::Storage { .. }
            | RelayerError::Configuration { .. } => false,
        }
    }

    /// Short machine-readable name of the error kind, used by snapshots and
    /// log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::Validation { .. } => "validation",
            RelayerError::Security(_) => "security",
            RelayerError::Network { .. } => "network",
            RelayerError::Contract { .. } => "contract",
            RelayerError::Storage { .. } => "storage",
            RelayerError::Configuration { .. } => "configuration",
        }
    }
}

/// Serializable projection of a [`RelayerError`], persisted on swaps that hit
/// a failed lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorSnapshot {
    pub fn capture(error: &RelayerError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_disposition_follows_the_taxonomy() {
        let retryable = [
            RelayerError::network(Chain::Ethereum, "get_logs", "connection reset"),
            RelayerError::contract("0xabc", "completeWithdrawal", ContractReason::NonceTooLow),
            RelayerError::contract("escrow.near", "fulfill_order", ContractReason::TimeoutWaitingForReceipt),
        ];
        for err in &retryable {
            assert!(err.is_retryable(), "{err} should retry");
        }

        let terminal = [
            RelayerError::validation("amount", "must be positive"),
            RelayerError::Security(SecurityIssue::PreimageMismatch),
            RelayerError::contract("0xabc", "refund", ContractReason::Reverted { tx_hash: None }),
            RelayerError::contract("0xabc", "call", ContractReason::InvalidReturn),
        ];
        for err in &terminal {
            assert!(!err.is_retryable(), "{err} should not retry");
        }
    }

    #[test]
    fn snapshot_captures_kind_and_message() {
        let err = RelayerError::Security(SecurityIssue::UnsafeTimelock);
        let snap = ErrorSnapshot::capture(&err);
        assert_eq!(snap.kind, "security");
        assert!(snap.message.contains("timelock"));
    }
}
