//! The named retry-policy table. Every chain-touching operation retries
//! under its own policy, and the retry predicate is the taxonomy's
//! [`RelayerError::is_retryable`], so the disposition of every error kind is
//! auditable here rather than scattered across call sites.

use std::time::Duration;

use relayer_services::{retry_with_policy, RetryPolicy};
use relayer_types::RelayerError;

/// Per-operation retry policies, overridable from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policies {
    pub factory_tx: RetryPolicy,
    pub withdraw_tx: RetryPolicy,
    pub refund_tx: RetryPolicy,
    pub near_view: RetryPolicy,
    pub near_function_call: RetryPolicy,
    pub eth_query_filter: RetryPolicy,
    pub eth_get_logs: RetryPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        let default = RetryPolicy::default();
        Self {
            factory_tx: default,
            withdraw_tx: default,
            refund_tx: default,
            near_view: default,
            near_function_call: default,
            eth_query_filter: default,
            eth_get_logs: default,
        }
    }
}

impl Policies {
    /// Derive the table from the relayer config section: `maxRetries` and
    /// `retryDelay` apply to every named operation.
    pub fn from_config(max_retries: u32, retry_delay_ms: u64) -> Self {
        let policy = RetryPolicy {
            retries: max_retries,
            min_delay: Duration::from_millis(retry_delay_ms.min(3000).max(1)),
            ..RetryPolicy::default()
        };
        Self {
            factory_tx: policy,
            withdraw_tx: policy,
            refund_tx: policy,
            near_view: policy,
            near_function_call: policy,
            eth_query_filter: policy,
            eth_get_logs: policy,
        }
    }
}

/// Retry a chain operation under a named policy, counting attempts into
/// `attempts`.
pub async fn run_with_retries<T, Fut, Op>(
    policy: &RetryPolicy,
    attempts: &mut u32,
    op: Op,
) -> Result<T, RelayerError>
where
    Fut: std::future::Future<Output = Result<T, RelayerError>>,
    Op: FnMut() -> Fut,
{
    let mut op = op;
    let counter = std::sync::atomic::AtomicU32::new(0u32);
    let result = retry_with_policy(
        policy,
        |error: &RelayerError, _attempt| error.is_retryable(),
        || {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            op()
        },
    )
    .await;
    *attempts += counter.load(std::sync::atomic::Ordering::Relaxed);
    result
}
