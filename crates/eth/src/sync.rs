//! Tracks how far the listener lags behind the finalized Ethereum head, and
//! paginates the catch-up so a single tick never requests logs for more than
//! `max_blocks_per_tick` blocks.

use core::ops::RangeInclusive;

/// The gap between the local cursor and the finalized remote head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncGap(RangeInclusive<u64>);

/// One page window inside a [`SyncGap`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncPage {
    current: RangeInclusive<u64>,
    size: u64,
    end: u64,
}

/// Finalized height for a remote head under the configured confirmation
/// depth. `confirmations = 1` means the head itself is final.
pub fn finalized_height(head: u64, confirmations: u64) -> u64 {
    head.saturating_sub(confirmations.saturating_sub(1))
}

impl SyncGap {
    /// `local` is the last processed height (`None` before the first run).
    /// Returns `None` when there is nothing to sync.
    pub fn new(local: Option<u64>, remote_finalized: u64, start_height: u64) -> Option<Self> {
        let oldest = local
            .map(|l| l.saturating_add(1))
            .unwrap_or(start_height)
            .max(start_height);
        (oldest <= remote_finalized).then(|| Self(oldest..=remote_finalized))
    }

    pub fn oldest(&self) -> u64 {
        *self.0.start()
    }

    pub fn latest(&self) -> u64 {
        *self.0.end()
    }

    pub fn page(&self, page_size: u64) -> Option<SyncPage> {
        let page = SyncPage {
            current: self.oldest()
                ..=self
                    .oldest()
                    .saturating_add(page_size.saturating_sub(1))
                    .min(self.latest()),
            size: page_size,
            end: self.latest(),
        };
        (!page.is_empty()).then_some(page)
    }
}

impl SyncPage {
    /// Advance to the next page window, or `None` once the gap is consumed.
    pub fn reduce(mut self) -> Option<Self> {
        self.current = self.current.start().saturating_add(self.size)
            ..=self.current.end().saturating_add(self.size).min(self.end);
        (!self.is_empty()).then_some(self)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() || self.size == 0
    }

    pub fn oldest(&self) -> u64 {
        *self.current.start()
    }

    pub fn latest(&self) -> u64 {
        *self.current.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finality_depth() {
        assert_eq!(finalized_height(100, 12), 89);
        assert_eq!(finalized_height(100, 1), 100);
        assert_eq!(finalized_height(5, 12), 0);
    }

    #[test]
    fn no_gap_when_synced() {
        assert_eq!(SyncGap::new(Some(100), 100, 0), None);
        assert_eq!(SyncGap::new(Some(101), 100, 0), None);
        let gap = SyncGap::new(Some(90), 100, 0).unwrap();
        assert_eq!((gap.oldest(), gap.latest()), (91, 100));
    }

    #[test]
    fn fresh_cursor_starts_at_the_deployment_height() {
        let gap = SyncGap::new(None, 100, 40).unwrap();
        assert_eq!((gap.oldest(), gap.latest()), (40, 100));
        // A stale cursor below the deployment height is clamped up.
        let gap = SyncGap::new(Some(10), 100, 40).unwrap();
        assert_eq!(gap.oldest(), 40);
    }

    #[test]
    fn pagination_covers_the_gap_exactly_once() {
        let gap = SyncGap::new(Some(0), 25, 0).unwrap();
        let mut page = gap.page(10).unwrap();
        let mut windows = vec![];
        loop {
            windows.push((page.oldest(), page.latest()));
            match page.reduce() {
                Some(next) => page = next,
                None => break,
            }
        }
        assert_eq!(windows, vec![(1, 10), (11, 20), (21, 25)]);
    }

    #[test]
    fn zero_page_size_yields_no_page() {
        let gap = SyncGap::new(Some(0), 10, 0).unwrap();
        assert!(gap.page(0).is_none());
    }
}
