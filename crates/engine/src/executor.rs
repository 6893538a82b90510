//! Bounded-concurrency work dispatcher with per-key serialization.
//!
//! Jobs are keyed by the swap's message id. At most one job per key is in
//! flight; work arriving for a busy key queues behind it in FIFO order, and
//! an exact duplicate of already-pending work is coalesced away. The global
//! in-flight count never exceeds `concurrency_limit`.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use relayer_types::{ChainEvent, MessageId, WorkItem};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkKind {
    /// A decoded chain observation to run through the coordinator.
    Event(ChainEvent),
    /// Periodic timelock check (boot reconciliation and the refund sweep).
    RefundSweep,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Work {
    pub key: MessageId,
    pub kind: WorkKind,
}

impl From<WorkItem> for Work {
    fn from(item: WorkItem) -> Self {
        Self {
            key: item.key,
            kind: WorkKind::Event(item.event),
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Handle one unit of work. Failures are the handler's to persist; the
    /// executor only guarantees scheduling discipline.
    async fn handle(&self, work: Work);
}

/// The concurrency limit arrives through a watch channel so a safe config
/// reload can raise or lower it without restarting the dispatcher. A lowered
/// limit applies as in-flight jobs drain.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub concurrency_limit: watch::Receiver<usize>,
}

impl ExecutorConfig {
    /// A limit that never changes. The receiver keeps serving the last value
    /// after the sender drops.
    pub fn fixed(limit: usize) -> Self {
        let (_tx, rx) = watch::channel(limit);
        Self {
            concurrency_limit: rx,
        }
    }
}

#[derive(Debug)]
pub struct ExecutorHandle {
    join: JoinHandle<()>,
    /// Queued + in-flight work, for the health snapshot.
    depth: watch::Receiver<usize>,
}

impl ExecutorHandle {
    /// Resolves when the input channel is closed and all in-flight work has
    /// finished.
    pub async fn drained(self) {
        let _ = self.join.await;
    }

    /// Drain with a deadline. On timeout the dispatcher is aborted and
    /// `false` is returned; unfinished work resumes from persisted state on
    /// the next boot.
    pub async fn drain_timeout(mut self, timeout: std::time::Duration) -> bool {
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(_) => true,
            Err(_) => {
                self.join.abort();
                false
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        *self.depth.borrow()
    }

    pub fn depth_watch(&self) -> watch::Receiver<usize> {
        self.depth.clone()
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn the dispatcher task. Closing the `rx` side's senders starts a
/// drain: queued-but-unstarted work is dropped (it resumes from persisted
/// state on the next boot), in-flight jobs run to completion.
pub fn spawn_executor<H: JobHandler>(
    mut rx: mpsc::Receiver<Work>,
    handler: Arc<H>,
    config: ExecutorConfig,
) -> ExecutorHandle {
    let (depth_tx, depth_rx) = watch::channel(0usize);
    let join = tokio::spawn(async move {
        let limit_rx = config.concurrency_limit;
        let limit = move || (*limit_rx.borrow()).max(1);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<MessageId>();

        // Key → work queued behind the in-flight job for that key.
        let mut in_flight: HashMap<MessageId, VecDeque<WorkKind>> = HashMap::new();
        // Keys with no free permit yet, in arrival order.
        let mut backlog: VecDeque<Work> = VecDeque::new();
        let mut running = 0usize;
        let mut accepting = true;

        loop {
            let total = running
                + backlog.len()
                + in_flight.values().map(VecDeque::len).sum::<usize>();
            let _ = depth_tx.send(total);

            if !accepting && running == 0 {
                break;
            }

            tokio::select! {
                work = rx.recv(), if accepting => {
                    match work {
                        None => {
                            accepting = false;
                            backlog.clear();
                        }
                        Some(work) => {
                            if let Some(pending) = in_flight.get_mut(&work.key) {
                                // Coalesce exact duplicates of pending work.
                                if pending.contains(&work.kind) {
                                    tracing::debug!(key = %work.key, "duplicate work coalesced");
                                } else {
                                    pending.push_back(work.kind);
                                }
                            } else if running < limit() {
                                running += 1;
                                in_flight.insert(work.key.clone(), VecDeque::new());
                                spawn_job(handler.clone(), work, done_tx.clone());
                            } else if backlog.iter().any(|queued| queued == &work) {
                                tracing::debug!(key = %work.key, "duplicate work coalesced");
                            } else {
                                backlog.push_back(work);
                            }
                        }
                    }
                }
                done = done_rx.recv() => {
                    let Some(key) = done else { break };
                    running -= 1;

                    // The finished key's queued work keeps its serial order.
                    let more = in_flight
                        .get_mut(&key)
                        .and_then(|pending| pending.pop_front());
                    match more {
                        Some(kind) => {
                            running += 1;
                            spawn_job(
                                handler.clone(),
                                Work { key: key.clone(), kind },
                                done_tx.clone(),
                            );
                        }
                        None => {
                            in_flight.remove(&key);
                            // A free permit goes to the oldest backlog entry
                            // whose key is idle.
                            if running < limit() {
                                let next = backlog
                                    .iter()
                                    .position(|work| !in_flight.contains_key(&work.key))
                                    .and_then(|i| backlog.remove(i));
                                if let Some(work) = next {
                                    running += 1;
                                    in_flight.insert(work.key.clone(), VecDeque::new());
                                    spawn_job(handler.clone(), work, done_tx.clone());
                                }
                            }
                        }
                    }
                }
            }
        }
        let _ = depth_tx.send(0);
    });

    ExecutorHandle {
        join,
        depth: depth_rx,
    }
}

fn spawn_job<H: JobHandler>(
    handler: Arc<H>,
    work: Work,
    done: mpsc::UnboundedSender<MessageId>,
) {
    tokio::spawn(async move {
        let key = work.key.clone();
        handler.handle(work).await;
        let _ = done.send(key);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct Recorder {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        per_key_active: Mutex<HashMap<MessageId, usize>>,
        handled: Mutex<Vec<Work>>,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                per_key_active: Mutex::new(HashMap::new()),
                handled: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, work: Work) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            {
                let mut per_key = self.per_key_active.lock().await;
                let active = per_key.entry(work.key.clone()).or_insert(0);
                *active += 1;
                assert_eq!(*active, 1, "two jobs in flight for {}", work.key);
            }

            tokio::time::sleep(self.delay).await;

            {
                let mut per_key = self.per_key_active.lock().await;
                *per_key.get_mut(&work.key).unwrap() -= 1;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.lock().await.push(work);
        }
    }

    fn key(n: usize) -> MessageId {
        MessageId::parse(format!("eth:0xkey{n}:0")).unwrap()
    }

    fn sweep(n: usize) -> Work {
        Work {
            key: key(n),
            kind: WorkKind::RefundSweep,
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let (tx, rx) = mpsc::channel(64);
        let recorder = Arc::new(Recorder::new(Duration::from_millis(20)));
        let handle = spawn_executor(
            rx,
            recorder.clone(),
            ExecutorConfig::fixed(4),
        );

        for n in 0..16 {
            tx.send(sweep(n)).await.unwrap();
        }
        drop(tx);
        handle.drained().await;

        assert_eq!(recorder.handled.lock().await.len(), 16);
        assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn same_key_work_is_serialized_in_order() {
        let (tx, rx) = mpsc::channel(64);
        let recorder = Arc::new(Recorder::new(Duration::from_millis(5)));
        let handle = spawn_executor(
            rx,
            recorder.clone(),
            ExecutorConfig::fixed(4),
        );

        // Three distinct pieces of work for one key; the per-key assertion
        // inside the handler fails if any two overlap.
        let events: Vec<Work> = (0..3)
            .map(|i| Work {
                key: key(0),
                kind: WorkKind::Event(ChainEvent::NearOrderRefunded {
                    meta: relayer_types::EventMeta {
                        message_id: MessageId::parse(format!("near:Tx{i}:0")).unwrap(),
                        chain: relayer_types::Chain::Near,
                        block: i,
                        tx_hash: format!("Tx{i}"),
                    },
                    order_id: i,
                }),
            })
            .collect();
        for work in events.clone() {
            tx.send(work).await.unwrap();
        }
        drop(tx);
        handle.drained().await;

        let handled = recorder.handled.lock().await;
        assert_eq!(handled.len(), 3);
        // FIFO per key.
        assert_eq!(*handled, events);
    }

    #[tokio::test]
    async fn duplicate_pending_work_is_coalesced() {
        let (tx, rx) = mpsc::channel(64);
        let recorder = Arc::new(Recorder::new(Duration::from_millis(30)));
        let handle = spawn_executor(
            rx,
            recorder.clone(),
            ExecutorConfig::fixed(2),
        );

        // One running sweep and three identical re-submissions.
        for _ in 0..4 {
            tx.send(sweep(0)).await.unwrap();
        }
        drop(tx);
        handle.drained().await;

        // The first runs; of the three duplicates queued behind it, only one
        // survives coalescing.
        assert_eq!(recorder.handled.lock().await.len(), 2);
    }
}
