use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayerError;

/// 32-byte hashlock digest. Equal on both chains for a matched swap pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHash(#[serde(with = "hex")] pub [u8; 32]);

impl SecretHash {
    pub fn from_hex(raw: &str) -> Result<Self, RelayerError> {
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(raw)
            .map_err(|e| RelayerError::validation("secret_hash", e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RelayerError::validation("secret_hash", "must be exactly 32 bytes"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 32-byte preimage. The single most security-critical datum the relayer
/// handles: `Debug` is redacted and it never appears in info-level logs.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(#[serde(with = "hex")] [u8; 32]);

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(raw: &str) -> Result<Self, RelayerError> {
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(raw)
            .map_err(|e| RelayerError::validation("secret", e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RelayerError::validation("secret", "must be exactly 32 bytes"))?;
        Ok(Self(bytes))
    }

    /// SHA-256, the hash function both escrow contracts commit to.
    pub fn digest(&self) -> SecretHash {
        let hash = Sha256::digest(self.0);
        SecretHash(hash.into())
    }

    pub fn matches(&self, hash: &SecretHash) -> bool {
        &self.digest() == hash
    }

    /// Hex form for transaction arguments. Call sites that log must log the
    /// digest instead.
    pub fn expose_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let secret = Secret::new([7u8; 32]);
        let hash = secret.digest();
        assert!(secret.matches(&hash));
        assert!(!Secret::new([8u8; 32]).matches(&hash));
    }

    #[test]
    fn hex_parsing_accepts_prefixed_and_bare() {
        let bare = "11".repeat(32);
        let prefixed = format!("0x{bare}");
        assert_eq!(
            Secret::from_hex(&bare).unwrap(),
            Secret::from_hex(&prefixed).unwrap()
        );
        assert!(Secret::from_hex("deadbeef").is_err());
    }

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::new([9u8; 32]);
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
    }
}
