//! The store runs as its own task with an inbox: all mutations are messages,
//! all reads are request/reply. Callers never coordinate through locks, and
//! the task can persist atomically between messages.

use std::path::Path;

use relayer_types::{Chain, MessageId, Swap, SwapStatus};
use tokio::sync::{mpsc, oneshot};

use crate::store::{StatusStore, StoreError, SwapStats};

type Patch = Box<dyn FnOnce(&mut Swap) + Send>;

enum Request {
    IsProcessed {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        id: MessageId,
        reply: oneshot::Sender<Option<Swap>>,
    },
    FindByRef {
        reference: relayer_types::EscrowRef,
        reply: oneshot::Sender<Option<Swap>>,
    },
    All {
        reply: oneshot::Sender<Vec<Swap>>,
    },
    Stats {
        reply: oneshot::Sender<SwapStats>,
    },
    Begin {
        swap: Box<Swap>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Transition {
        id: MessageId,
        from: SwapStatus,
        to: SwapStatus,
        patch: Patch,
        reply: oneshot::Sender<Result<Swap, StoreError>>,
    },
    Annotate {
        id: MessageId,
        patch: Patch,
        reply: oneshot::Sender<Result<Swap, StoreError>>,
    },
    Resume {
        id: MessageId,
        reply: oneshot::Sender<Result<Swap, StoreError>>,
    },
    Cursor {
        chain: Chain,
        reply: oneshot::Sender<Option<u64>>,
    },
    AdvanceCursor {
        chain: Chain,
        height: u64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Clonable handle to the store task.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    tx: mpsc::Sender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::IsProcessed { .. } => "IsProcessed",
            Request::Get { .. } => "Get",
            Request::FindByRef { .. } => "FindByRef",
            Request::All { .. } => "All",
            Request::Stats { .. } => "Stats",
            Request::Begin { .. } => "Begin",
            Request::Transition { .. } => "Transition",
            Request::Annotate { .. } => "Annotate",
            Request::Resume { .. } => "Resume",
            Request::Cursor { .. } => "Cursor",
            Request::AdvanceCursor { .. } => "AdvanceCursor",
            Request::Flush { .. } => "Flush",
        };
        f.write_str(name)
    }
}

/// Load the on-disk snapshot and spawn the serializing task. Dropping every
/// handle flushes once more and ends the task.
pub fn spawn_store(dir: &Path) -> Result<StoreHandle, StoreError> {
    let store = StatusStore::load(dir)?;
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_store(store, rx));
    Ok(StoreHandle { tx })
}

async fn run_store(mut store: StatusStore, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::IsProcessed { id, reply } => {
                let _ = reply.send(store.is_processed(&id));
            }
            Request::Get { id, reply } => {
                let _ = reply.send(store.get(&id).cloned());
            }
            Request::FindByRef { reference, reply } => {
                let _ = reply.send(store.find_by_ref(&reference).cloned());
            }
            Request::All { reply } => {
                let _ = reply.send(store.all().cloned().collect());
            }
            Request::Stats { reply } => {
                let _ = reply.send(store.stats());
            }
            Request::Begin { swap, reply } => {
                let _ = reply.send(store.begin(*swap));
            }
            Request::Transition {
                id,
                from,
                to,
                patch,
                reply,
            } => {
                let _ = reply.send(store.transition(&id, from, to, patch));
            }
            Request::Annotate { id, patch, reply } => {
                let _ = reply.send(store.annotate(&id, patch));
            }
            Request::Resume { id, reply } => {
                let _ = reply.send(store.resume(&id));
            }
            Request::Cursor { chain, reply } => {
                let _ = reply.send(store.cursor(chain));
            }
            Request::AdvanceCursor {
                chain,
                height,
                reply,
            } => {
                let _ = reply.send(store.advance_cursor(chain, height));
            }
            Request::Flush { reply } => {
                let _ = reply.send(store.flush());
            }
        }
    }
    if let Err(e) = store.flush() {
        tracing::error!(error = %e, "final store flush failed");
    }
}

impl StoreHandle {
    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| store_gone())?;
        rx.await.map_err(|_| store_gone())
    }

    pub async fn is_processed(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.send(|reply| Request::IsProcessed {
            id: id.clone(),
            reply,
        })
        .await
    }

    pub async fn get(&self, id: &MessageId) -> Result<Option<Swap>, StoreError> {
        self.send(|reply| Request::Get {
            id: id.clone(),
            reply,
        })
        .await
    }

    pub async fn find_by_ref(
        &self,
        reference: &relayer_types::EscrowRef,
    ) -> Result<Option<Swap>, StoreError> {
        self.send(|reply| Request::FindByRef {
            reference: reference.clone(),
            reply,
        })
        .await
    }

    pub async fn all(&self) -> Result<Vec<Swap>, StoreError> {
        self.send(|reply| Request::All { reply }).await
    }

    pub async fn stats(&self) -> Result<SwapStats, StoreError> {
        self.send(|reply| Request::Stats { reply }).await
    }

    pub async fn begin(&self, swap: Swap) -> Result<(), StoreError> {
        self.send(|reply| Request::Begin {
            swap: Box::new(swap),
            reply,
        })
        .await?
    }

    pub async fn transition(
        &self,
        id: &MessageId,
        from: SwapStatus,
        to: SwapStatus,
        patch: impl FnOnce(&mut Swap) + Send + 'static,
    ) -> Result<Swap, StoreError> {
        self.send(|reply| Request::Transition {
            id: id.clone(),
            from,
            to,
            patch: Box::new(patch),
            reply,
        })
        .await?
    }

    /// Terminal transition; the id joins the processed set atomically with
    /// the state change.
    pub async fn mark_terminal(
        &self,
        id: &MessageId,
        from: SwapStatus,
        terminal: SwapStatus,
        patch: impl FnOnce(&mut Swap) + Send + 'static,
    ) -> Result<Swap, StoreError> {
        debug_assert!(terminal.is_terminal());
        self.transition(id, from, terminal, patch).await
    }

    pub async fn annotate(
        &self,
        id: &MessageId,
        patch: impl FnOnce(&mut Swap) + Send + 'static,
    ) -> Result<Swap, StoreError> {
        self.send(|reply| Request::Annotate {
            id: id.clone(),
            patch: Box::new(patch),
            reply,
        })
        .await?
    }

    pub async fn resume(&self, id: &MessageId) -> Result<Swap, StoreError> {
        self.send(|reply| Request::Resume {
            id: id.clone(),
            reply,
        })
        .await?
    }

    pub async fn cursor(&self, chain: Chain) -> Result<Option<u64>, StoreError> {
        self.send(|reply| Request::Cursor { chain, reply }).await
    }

    pub async fn advance_cursor(&self, chain: Chain, height: u64) -> Result<(), StoreError> {
        self.send(|reply| Request::AdvanceCursor {
            chain,
            height,
            reply,
        })
        .await?
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.send(|reply| Request::Flush { reply }).await?
    }
}

fn store_gone() -> StoreError {
    StoreError::Relayer(relayer_types::RelayerError::Storage {
        operation: relayer_types::StorageOperation::Persist,
        path: String::new(),
        reason: "store task is gone".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ethers_core::types::U256;
    use relayer_types::{Amount, Direction, Secret};

    fn sample_swap(id: &str) -> Swap {
        Swap {
            message_id: MessageId::parse(id).unwrap(),
            direction: Direction::NearToEth,
            secret_hash: Secret::new([4u8; 32]).digest(),
            secret: None,
            amount_source: Amount::Yocto(500_000_000_000_000_000_000_000),
            amount_dest: Amount::Wei(U256::from(10_000u64)),
            initiator: "bob.near".into(),
            recipient: "0x742d35cc6634c0532925a3b844bc454e4438f44e".into(),
            timelock_source: 2_000_000_000,
            timelock_dest: 1_999_000_000,
            status: SwapStatus::Observed,
            source_ref: None,
            escrow_ref: None,
            attempts: Default::default(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn handle_serializes_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_store(dir.path()).unwrap();

        handle.begin(sample_swap("near:AA11:0")).await.unwrap();
        let id = MessageId::parse("near:AA11:0").unwrap();
        assert!(!handle.is_processed(&id).await.unwrap());

        let err = handle.begin(sample_swap("near:AA11:0")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let swap = handle
            .transition(&id, SwapStatus::Observed, SwapStatus::Mirroring, |_| {})
            .await
            .unwrap();
        assert_eq!(swap.status, SwapStatus::Mirroring);

        handle
            .mark_terminal(&id, SwapStatus::Mirroring, SwapStatus::Failed, |_| {})
            .await
            .unwrap();
        assert!(handle.is_processed(&id).await.unwrap());

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.by_status.get(&SwapStatus::Failed), Some(&1));
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn concurrent_begins_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_store(dir.path()).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.begin(sample_swap("eth:0xff:7")).await
            }));
        }
        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }
}
