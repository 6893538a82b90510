use ethers_core::types::U256;
use serde::{Deserialize, Serialize};

use crate::error::RelayerError;

/// A chain-native amount with an explicit unit tag. Amounts never cross the
/// adapter boundary as bare integers, and no cross-unit arithmetic exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum Amount {
    /// Ethereum-side value in wei.
    Wei(#[serde(with = "u256_dec")] U256),
    /// NEAR-side value in yoctoNEAR.
    Yocto(#[serde(with = "u128_dec")] u128),
}

impl Amount {
    pub fn is_zero(&self) -> bool {
        match self {
            Amount::Wei(v) => v.is_zero(),
            Amount::Yocto(v) => *v == 0,
        }
    }

    pub fn as_wei(&self) -> Result<U256, RelayerError> {
        match self {
            Amount::Wei(v) => Ok(*v),
            Amount::Yocto(_) => Err(RelayerError::validation(
                "amount",
                "expected a wei amount, found yoctoNEAR",
            )),
        }
    }

    pub fn as_yocto(&self) -> Result<u128, RelayerError> {
        match self {
            Amount::Yocto(v) => Ok(*v),
            Amount::Wei(_) => Err(RelayerError::validation(
                "amount",
                "expected a yoctoNEAR amount, found wei",
            )),
        }
    }

    /// Re-express this amount in the counterparty chain's base unit. Matched
    /// orders carry the same numeric value on both sides; only the decimal
    /// base differs (wei is 10^-18 of a coin, yoctoNEAR 10^-24).
    pub fn mirrored(&self) -> Result<Amount, RelayerError> {
        const WEI_TO_YOCTO: u128 = 1_000_000;
        match self {
            Amount::Wei(v) => {
                if *v > U256::from(u128::MAX) {
                    return Err(RelayerError::validation("amount", "wei value out of range"));
                }
                let yocto = v
                    .as_u128()
                    .checked_mul(WEI_TO_YOCTO)
                    .ok_or_else(|| RelayerError::validation("amount", "yocto mirror overflows"))?;
                Ok(Amount::Yocto(yocto))
            }
            Amount::Yocto(v) => Ok(Amount::Wei(U256::from(v / WEI_TO_YOCTO))),
        }
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Amount::Wei(v) => write!(f, "{v} wei"),
            Amount::Yocto(v) => write!(f, "{v} yoctoNEAR"),
        }
    }
}

/// U256 amounts serialize as decimal strings so the on-disk format stays
/// readable and independent of any fixed-width integer encoding.
mod u256_dec {
    use super::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_dec_str(&raw).map_err(serde::de::Error::custom)
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_tagged_decimal_strings() {
        let wei = Amount::Wei(U256::from(10_000_000_000_000_000u64));
        let json = serde_json::to_value(wei).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"unit": "wei", "value": "10000000000000000"})
        );
        assert_eq!(serde_json::from_value::<Amount>(json).unwrap(), wei);

        let yocto = Amount::Yocto(500_000_000_000_000_000_000_000);
        let back: Amount = serde_json::from_str(&serde_json::to_string(&yocto).unwrap()).unwrap();
        assert_eq!(back, yocto);
    }

    #[test]
    fn mirroring_rescales_between_bases() {
        // 0.01 ETH <-> 0.01 NEAR.
        let wei = Amount::Wei(U256::from(10_000_000_000_000_000u64));
        let yocto = Amount::Yocto(10_000_000_000_000_000_000_000);
        assert_eq!(wei.mirrored().unwrap(), yocto);
        assert_eq!(yocto.mirrored().unwrap(), wei);
    }

    #[test]
    fn unit_mismatch_is_an_error() {
        assert!(Amount::Wei(U256::one()).as_yocto().is_err());
        assert!(Amount::Yocto(1).as_wei().is_err());
        assert!(Amount::Yocto(0).is_zero());
    }
}
