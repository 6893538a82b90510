//! The in-memory snapshot behind the store task, and its on-disk layout.
//!
//! Three files live in the storage directory, all rewritten with the same
//! atomic-rename discipline:
//! - `processed_messages.json`: JSON array of finished message ids
//!   (backward-compatible with earlier deployments),
//! - `swaps.json`: JSON array of full swap records,
//! - `cursors.json`: per-chain `last_processed_block`.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use chrono::Utc;
use relayer_types::{
    Chain,
    MessageId,
    RelayerError,
    Swap,
    SwapStatus,
};

use crate::{
    file::{load_json_or_default, write_json_atomic},
    paths::validate_filename,
};

pub const PROCESSED_FILE: &str = "processed_messages.json";
pub const SWAPS_FILE: &str = "swaps.json";
pub const CURSORS_FILE: &str = "cursors.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("swap {0} already exists")]
    AlreadyExists(MessageId),

    #[error("swap {0} not found")]
    NotFound(MessageId),

    #[error("swap {id} is in state {actual}, expected {expected}")]
    UnexpectedState {
        id: MessageId,
        expected: SwapStatus,
        actual: SwapStatus,
    },

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: MessageId,
        from: SwapStatus,
        to: SwapStatus,
    },

    #[error("swap {id} in state {status} cannot be resumed")]
    NotResumable { id: MessageId, status: SwapStatus },

    #[error(transparent)]
    Relayer(#[from] RelayerError),
}

impl From<StoreError> for RelayerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Relayer(inner) => inner,
            other => RelayerError::Storage {
                operation: relayer_types::StorageOperation::Transition,
                path: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

/// Swap counts by status, reported through the supervisor's health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub by_status: BTreeMap<SwapStatus, usize>,
    pub processed: usize,
}

/// The single owner of all persisted relayer state. Wrapped in a task by
/// [`crate::spawn_store`]; nothing else touches the files.
#[derive(Debug)]
pub struct StatusStore {
    dir: PathBuf,
    processed: BTreeSet<MessageId>,
    swaps: BTreeMap<MessageId, Swap>,
    cursors: BTreeMap<Chain, u64>,
}

impl StatusStore {
    /// Read the on-disk snapshot. Missing or empty files start empty; a
    /// malformed file fails the load and blocks startup.
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        for name in [PROCESSED_FILE, SWAPS_FILE, CURSORS_FILE] {
            validate_filename(name)?;
        }

        let raw_processed: Vec<String> = load_json_or_default(&dir.join(PROCESSED_FILE))?;
        let mut processed = BTreeSet::new();
        for raw in raw_processed {
            match MessageId::parse(raw) {
                Ok(id) => {
                    processed.insert(id);
                }
                Err(e) => {
                    return Err(StoreError::Relayer(RelayerError::Storage {
                        operation: relayer_types::StorageOperation::Load,
                        path: dir.join(PROCESSED_FILE).display().to_string(),
                        reason: e.to_string(),
                    }))
                }
            }
        }

        let swap_list: Vec<Swap> = load_json_or_default(&dir.join(SWAPS_FILE))?;
        let swaps = swap_list
            .into_iter()
            .map(|swap| (swap.message_id.clone(), swap))
            .collect();

        let cursors: BTreeMap<Chain, u64> = load_json_or_default(&dir.join(CURSORS_FILE))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            processed,
            swaps,
            cursors,
        })
    }

    pub fn is_processed(&self, id: &MessageId) -> bool {
        self.processed.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Swap> {
        self.swaps.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Swap> {
        self.swaps.values()
    }

    /// Look a swap up by either its source deposit reference or its mirror
    /// escrow reference. Progression events correlate through these.
    pub fn find_by_ref(&self, reference: &relayer_types::EscrowRef) -> Option<&Swap> {
        self.swaps.values().find(|swap| {
            swap.source_ref.as_ref() == Some(reference)
                || swap.escrow_ref.as_ref() == Some(reference)
        })
    }

    pub fn stats(&self) -> SwapStats {
        let mut by_status = BTreeMap::new();
        for swap in self.swaps.values() {
            *by_status.entry(swap.status).or_insert(0) += 1;
        }
        SwapStats {
            by_status,
            processed: self.processed.len(),
        }
    }

    pub fn cursor(&self, chain: Chain) -> Option<u64> {
        self.cursors.get(&chain).copied()
    }

    pub fn advance_cursor(&mut self, chain: Chain, height: u64) -> Result<(), StoreError> {
        let entry = self.cursors.entry(chain).or_insert(0);
        // Monotonic: a concurrent replay can never move the cursor backwards.
        if height > *entry {
            *entry = height;
            self.persist_cursors()?;
        }
        Ok(())
    }

    /// The idempotency gate: insert a fresh record in `observed` or fail.
    pub fn begin(&mut self, swap: Swap) -> Result<(), StoreError> {
        let id = swap.message_id.clone();
        if self.processed.contains(&id) || self.swaps.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        if swap.status != SwapStatus::Observed {
            return Err(StoreError::IllegalTransition {
                id,
                from: swap.status,
                to: SwapStatus::Observed,
            });
        }
        self.swaps.insert(id, swap);
        self.persist_swaps()
    }

    /// Validate the expected current state, apply the patch, advance
    /// `updated_at`, persist.
    pub fn transition(
        &mut self,
        id: &MessageId,
        from: SwapStatus,
        to: SwapStatus,
        patch: impl FnOnce(&mut Swap),
    ) -> Result<Swap, StoreError> {
        let swap = self
            .swaps
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if swap.status != from {
            return Err(StoreError::UnexpectedState {
                id: id.clone(),
                expected: from,
                actual: swap.status,
            });
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        patch(swap);
        swap.status = to;
        swap.updated_at = Utc::now();
        let updated = swap.clone();

        if to.is_terminal() {
            self.processed.insert(id.clone());
            self.persist_processed()?;
        }
        self.persist_swaps()?;
        Ok(updated)
    }

    /// Apply a patch without a state transition (attempt counters, error
    /// snapshots). `updated_at` advances and the record persists.
    pub fn annotate(
        &mut self,
        id: &MessageId,
        patch: impl FnOnce(&mut Swap),
    ) -> Result<Swap, StoreError> {
        let swap = self
            .swaps
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let status = swap.status;
        patch(swap);
        // Status changes must go through `transition`.
        swap.status = status;
        swap.updated_at = Utc::now();
        let updated = swap.clone();
        self.persist_swaps()?;
        Ok(updated)
    }

    /// Operator action: reset a failed swap to the nearest safe prior state
    /// and drop it from the processed set so its events re-enqueue.
    pub fn resume(&mut self, id: &MessageId) -> Result<Swap, StoreError> {
        let swap = self
            .swaps
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if swap.status != SwapStatus::Failed {
            return Err(StoreError::NotResumable {
                id: id.clone(),
                status: swap.status,
            });
        }

        swap.status = if swap.escrow_ref.is_some() {
            SwapStatus::AwaitingSettlement
        } else {
            SwapStatus::Observed
        };
        swap.last_error = None;
        swap.updated_at = Utc::now();
        let updated = swap.clone();

        self.processed.remove(id);
        self.persist_processed()?;
        self.persist_swaps()?;
        Ok(updated)
    }

    /// Rewrite every file. Called once more during shutdown so the final
    /// state on disk is the last consistent one.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.persist_processed()?;
        self.persist_swaps()?;
        self.persist_cursors()
    }

    fn persist_processed(&self) -> Result<(), StoreError> {
        let list: Vec<&str> = self.processed.iter().map(|id| id.as_str()).collect();
        write_json_atomic(&self.dir.join(PROCESSED_FILE), &list)?;
        Ok(())
    }

    fn persist_swaps(&self) -> Result<(), StoreError> {
        let list: Vec<&Swap> = self.swaps.values().collect();
        write_json_atomic(&self.dir.join(SWAPS_FILE), &list)?;
        Ok(())
    }

    fn persist_cursors(&self) -> Result<(), StoreError> {
        write_json_atomic(&self.dir.join(CURSORS_FILE), &self.cursors)?;
        Ok(())
    }
}
