//! Aggregated health snapshot, collected by the supervisor from the shared
//! data of every sub-service.

use relayer_services::State;
use relayer_storage::SwapStats;

#[derive(Debug, Clone)]
pub struct Health {
    pub eth_listener: State,
    pub near_listener: State,
    pub eth_cursor: Option<u64>,
    pub near_cursor: Option<u64>,
    /// Queued plus in-flight work in the executor.
    pub executor_depth: usize,
    pub swaps: SwapStats,
}

impl Health {
    /// Healthy means both listeners are alive; a stopped worker is surfaced
    /// here while the other chain's pipeline keeps running.
    pub fn is_healthy(&self) -> bool {
        self.eth_listener.started() && self.near_listener.started()
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "eth={:?}@{:?} near={:?}@{:?} queue={} swaps={:?} processed={}",
            self.eth_listener,
            self.eth_cursor,
            self.near_listener,
            self.near_cursor,
            self.executor_depth,
            self.swaps.by_status,
            self.swaps.processed,
        )
    }
}
