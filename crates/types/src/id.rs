use ethers_core::types::H256;
use serde::{Deserialize, Serialize};

use crate::error::RelayerError;

/// Canonical idempotency key of a single cross-chain event.
///
/// Derivation is fixed per chain so replays of the same on-chain event always
/// map to the same key:
/// - Ethereum: `eth:{tx_hash}:{log_index}`
/// - NEAR: `near:{tx_hash}:{receipt_index}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub const MAX_LEN: usize = 256;

    /// Validate an externally supplied id (e.g. loaded from disk or passed to
    /// `resume`).
    pub fn parse(raw: impl Into<String>) -> Result<Self, RelayerError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(RelayerError::validation("message_id", "must not be empty"));
        }
        if raw.len() > Self::MAX_LEN {
            return Err(RelayerError::validation(
                "message_id",
                format!("longer than {} characters", Self::MAX_LEN),
            ));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'.' | b'-'))
        {
            return Err(RelayerError::validation(
                "message_id",
                "contains characters outside [A-Za-z0-9:_.-]",
            ));
        }
        Ok(Self(raw))
    }

    pub fn from_eth(tx_hash: H256, log_index: u64) -> Self {
        Self(format!("eth:{tx_hash:#x}:{log_index}"))
    }

    pub fn from_near(tx_hash: &str, receipt_index: u64) -> Self {
        Self(format!("near:{tx_hash}:{receipt_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
