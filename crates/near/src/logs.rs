//! Grammar for the escrow contract's log lines. The contract is stringly
//! typed on the wire; these anchored patterns are the contract. Lines that do
//! not match are ignored, matching lines with out-of-range numbers are
//! dropped with a warning.

use std::sync::LazyLock;

use regex::Regex;
use relayer_types::Secret;

static CREATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Created swap order (\d+) for (\d+) yoctoNEAR to recipient (\S+)$")
        .expect("static pattern")
});
static FULFILLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Fulfilled swap order (\d+) with secret ([0-9a-fA-F]{64})$")
        .expect("static pattern")
});
static REFUNDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Refunded swap order (\d+)$").expect("static pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowLog {
    Created {
        order_id: u64,
        amount_yocto: u128,
        recipient: String,
    },
    Fulfilled {
        order_id: u64,
        secret: Secret,
    },
    Refunded {
        order_id: u64,
    },
}

pub fn parse_escrow_log(line: &str) -> Option<EscrowLog> {
    if let Some(captures) = CREATED.captures(line) {
        let order_id = captures[1].parse().ok();
        let amount_yocto = captures[2].parse().ok();
        let (Some(order_id), Some(amount_yocto)) = (order_id, amount_yocto) else {
            tracing::warn!(line, "escrow log with out-of-range numbers");
            return None;
        };
        return Some(EscrowLog::Created {
            order_id,
            amount_yocto,
            recipient: captures[3].to_string(),
        });
    }
    if let Some(captures) = FULFILLED.captures(line) {
        let Ok(order_id) = captures[1].parse() else {
            tracing::warn!(line, "escrow log with out-of-range order id");
            return None;
        };
        // The pattern guarantees 64 hex characters.
        let secret = Secret::from_hex(&captures[2]).ok()?;
        return Some(EscrowLog::Fulfilled { order_id, secret });
    }
    if let Some(captures) = REFUNDED.captures(line) {
        let Ok(order_id) = captures[1].parse() else {
            tracing::warn!(line, "escrow log with out-of-range order id");
            return None;
        };
        return Some(EscrowLog::Refunded { order_id });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_log_shapes() {
        assert_eq!(
            parse_escrow_log(
                "Created swap order 17 for 500000000000000000000000 yoctoNEAR to recipient alice.near"
            ),
            Some(EscrowLog::Created {
                order_id: 17,
                amount_yocto: 500_000_000_000_000_000_000_000,
                recipient: "alice.near".into(),
            })
        );

        let secret_hex = "aa".repeat(32);
        assert_eq!(
            parse_escrow_log(&format!("Fulfilled swap order 17 with secret {secret_hex}")),
            Some(EscrowLog::Fulfilled {
                order_id: 17,
                secret: Secret::from_hex(&secret_hex).unwrap(),
            })
        );

        assert_eq!(
            parse_escrow_log("Refunded swap order 9"),
            Some(EscrowLog::Refunded { order_id: 9 })
        );
    }

    #[test]
    fn unmatched_lines_are_ignored() {
        for line in [
            "",
            "Transferred 5 NEAR to bob.near",
            "Created swap order for 5 yoctoNEAR to recipient alice.near",
            "Created swap order 1 for 5 yoctoNEAR to recipient alice.near trailing",
            "Fulfilled swap order 17 with secret deadbeef",
            "prefix Refunded swap order 9",
        ] {
            assert_eq!(parse_escrow_log(line), None, "{line:?} should not parse");
        }
    }

    #[test]
    fn out_of_range_numbers_are_dropped_not_mangled() {
        let line = format!(
            "Created swap order {} for 1 yoctoNEAR to recipient a.near",
            u128::from(u64::MAX) + 1
        );
        assert_eq!(parse_escrow_log(&line), None);
    }
}
