use anyhow::anyhow;
use tokio::sync::watch;

/// Receiver side of the service state channel. Workers poll it between
/// suspension points to observe a stop request.
pub type StateWatcher = watch::Receiver<State>;

#[derive(Debug, Clone)]
pub enum State {
    NotStarted,
    Started,
    Stopping,
    Stopped,
    StoppedWithError(String),
}

impl State {
    pub fn not_started(&self) -> bool {
        self == &State::NotStarted
    }

    pub fn started(&self) -> bool {
        self == &State::Started
    }

    pub fn stopped(&self) -> bool {
        matches!(self, State::Stopped | State::StoppedWithError(_))
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::NotStarted, Self::NotStarted)
                | (Self::Started, Self::Started)
                | (Self::Stopping, Self::Stopping)
                | (Self::Stopped, Self::Stopped)
                | (Self::StoppedWithError(_), Self::StoppedWithError(_))
        )
    }
}

/// Control surface of a running service.
#[async_trait::async_trait]
pub trait Service {
    fn start(&self) -> anyhow::Result<()>;

    /// Request the service to stop. Returns `false` if it was not running.
    fn stop(&self) -> bool;

    async fn stop_and_await(&self) -> anyhow::Result<State>;

    fn state(&self) -> State;
}

/// The long-running body of a service, driven by a [`ServiceRunner`].
#[async_trait::async_trait]
pub trait RunnableService: Send {
    const NAME: &'static str;

    /// Data shared with the rest of the process while the service runs.
    type SharedData: Clone + Send + Sync;

    fn shared_data(&self) -> Self::SharedData;

    /// One-time setup before the run loop. Failure here stops the service.
    async fn initialize(&mut self) -> anyhow::Result<()>;

    /// A single iteration of the service loop. Return `Ok(true)` to be called
    /// again, `Ok(false)` to stop cleanly. An error is fatal for this service:
    /// transient failures are expected to be retried inside `run`.
    async fn run(&mut self, watcher: &mut StateWatcher) -> anyhow::Result<bool>;

    /// Teardown after the loop exits, regardless of the exit reason.
    async fn shutdown(self) -> anyhow::Result<()>;
}

/// Spawns a [`RunnableService`] on the runtime and tracks its lifecycle
/// through a watch channel.
#[derive(Debug)]
pub struct ServiceRunner<S>
where
    S: RunnableService + 'static,
{
    pub shared: S::SharedData,
    name: &'static str,
    state: std::sync::Arc<watch::Sender<State>>,
}

impl<S> Clone for ServiceRunner<S>
where
    S: RunnableService + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            name: self.name,
            state: self.state.clone(),
        }
    }
}

impl<S> ServiceRunner<S>
where
    S: RunnableService + 'static,
{
    pub fn new(service: S) -> Self {
        let shared = service.shared_data();
        let state = initialize_loop(service);
        Self {
            shared,
            name: S::NAME,
            state,
        }
    }

    /// Wait until the service leaves `NotStarted`/`Started`, returning the
    /// terminal state. Used by tests and by the supervisor during shutdown.
    pub async fn await_stop(&self) -> anyhow::Result<State> {
        let mut stop = self.state.subscribe();
        loop {
            let state = stop.borrow_and_update().clone();
            if state.stopped() {
                return Ok(state);
            }
            stop.changed().await?;
        }
    }
}

#[async_trait::async_trait]
impl<S> Service for ServiceRunner<S>
where
    S: RunnableService + 'static,
{
    fn start(&self) -> anyhow::Result<()> {
        let started = self.state.send_if_modified(|state| {
            if state.not_started() {
                *state = State::Started;
                true
            } else {
                false
            }
        });

        if started {
            Ok(())
        } else {
            Err(anyhow!("the service {} has already been started", self.name))
        }
    }

    fn stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.not_started() || state.started() {
                *state = State::Stopping;
                true
            } else {
                false
            }
        })
    }

    async fn stop_and_await(&self) -> anyhow::Result<State> {
        self.stop();
        self.await_stop().await
    }

    fn state(&self) -> State {
        self.state.borrow().clone()
    }
}

fn initialize_loop<S>(service: S) -> std::sync::Arc<watch::Sender<State>>
where
    S: RunnableService + 'static,
{
    let (sender, receiver) = watch::channel(State::NotStarted);
    let state = std::sync::Arc::new(sender);
    let stop_sender = state.clone();
    tokio::task::spawn(async move {
        let result = run(service, receiver).await;

        let stopped_state = match result {
            Ok(()) => State::Stopped,
            Err(e) => {
                tracing::error!(service = S::NAME, error = %e, "service stopped with an error");
                State::StoppedWithError(e.to_string())
            }
        };

        let _ = stop_sender.send_if_modified(|state| {
            if !state.stopped() {
                *state = stopped_state;
                true
            } else {
                false
            }
        });
    });
    state
}

async fn run<S>(mut service: S, mut state: StateWatcher) -> anyhow::Result<()>
where
    S: RunnableService + 'static,
{
    if state.borrow_and_update().not_started() {
        state.changed().await?;
    }

    if !state.borrow().started() {
        return service.shutdown().await;
    }

    if let Err(e) = service.initialize().await {
        let _ = service.shutdown().await;
        return Err(e);
    }
    tracing::debug!(service = S::NAME, "service started");

    let result = loop {
        let mut changed_state = state.clone();
        tokio::select! {
            biased;

            _ = changed_state.changed() => {
                if !state.borrow_and_update().started() {
                    break Ok(());
                }
            }

            result = service.run(&mut state) => {
                match result {
                    Ok(should_continue) => {
                        if !should_continue {
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };

    let shutdown = service.shutdown().await;
    result.and(shutdown)
}
