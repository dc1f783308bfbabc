//! Session driver task and its handle.

use std::sync::Arc;
use std::time::Duration;

use dicefeed_core::{AuthBundle, FeedError};
use dicefeed_store::HistoryStore;
use dicefeed_telemetry::FeedMetrics;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::CredentialProvider;
use crate::feed::{HistoryEntry, LatestRound, RoundFeed};
use crate::machine::{Effect, SessionConfig, SessionEvent, SessionMachine, SessionStatus};
use crate::transport::{Connector, EventSink, Outbound, TransportEvent, TransportHandle};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborators the session needs.
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialProvider>,
    pub connector: Arc<dyn Connector>,
    pub history: Arc<HistoryStore>,
    pub metrics: Arc<FeedMetrics>,
}

enum Command {
    Reconnect,
}

/// Handle to the running session. Cheap to share behind an `Arc`.
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    history: Arc<HistoryStore>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Spawn the driver task and start connecting. Must be called inside a
    /// tokio runtime.
    pub fn spawn(config: SessionConfig, deps: SessionDeps) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let cancel = CancellationToken::new();
        let history = Arc::clone(&deps.history);

        let (driver, inbox) = Driver::new(config, deps, status_tx);
        let task = tokio::spawn(driver.run(command_rx, inbox, cancel.clone()));

        Self {
            commands,
            status,
            history,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn history_store(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.history)
    }

    /// Stop the driver, tear down the transport and wait for the task.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        let Some(task) = task else { return };
        let abort = task.abort_handle();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => info!("session stopped"),
            Ok(Err(e)) => warn!(error = %e, "session task failed"),
            Err(_) => {
                warn!("session shutdown timed out, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RoundFeed for SessionManager {
    fn latest_round(&self) -> Option<LatestRound> {
        let round = self.history.latest()?;
        Some(LatestRound::new(&round, &self.status.borrow()))
    }

    fn history(&self) -> Vec<HistoryEntry> {
        self.history.read().iter().map(HistoryEntry::from).collect()
    }

    fn request_reconnect(&self) {
        if self.commands.send(Command::Reconnect).is_err() {
            debug!("session stopped, reconnect request ignored");
        }
    }

    fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Results of spawned I/O, routed back into the loop.
enum Completion {
    Credentials {
        ticket: u64,
        result: Result<AuthBundle, FeedError>,
    },
    Opened {
        generation: u64,
        result: Result<TransportHandle, FeedError>,
    },
}

/// Owns the machine and the single live transport.
struct Driver {
    machine: SessionMachine,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    status: watch::Sender<SessionStatus>,
    live: Option<(u64, TransportHandle)>,
    tasks: JoinSet<()>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

/// Receiving ends of the driver's internal channels.
struct Inbox {
    completions: mpsc::UnboundedReceiver<Completion>,
    transport_events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
}

impl Driver {
    fn new(
        config: SessionConfig,
        deps: SessionDeps,
        status: watch::Sender<SessionStatus>,
    ) -> (Self, Inbox) {
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let driver = Self {
            machine: SessionMachine::new(config, deps.history, deps.metrics),
            credentials: deps.credentials,
            connector: deps.connector,
            status,
            live: None,
            tasks: JoinSet::new(),
            completion_tx,
            transport_tx,
        };
        let inbox = Inbox {
            completions,
            transport_events,
        };
        (driver, inbox)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: Inbox,
        cancel: CancellationToken,
    ) {
        info!("session driver started");
        self.step(SessionEvent::Start);

        loop {
            let deadline = self.machine.next_deadline();
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    Command::Reconnect => SessionEvent::ReconnectRequested,
                },
                Some(completion) = inbox.completions.recv() => match self.complete(completion) {
                    Some(event) => event,
                    None => continue,
                },
                Some((generation, event)) = inbox.transport_events.recv() => {
                    transport_event(generation, event)
                }
                () = sleep_until(deadline) => SessionEvent::TimerFired,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => continue,
            };
            self.step(event);
        }

        self.step(SessionEvent::Shutdown);
        self.tasks.abort_all();
        info!("session driver stopped");
    }

    fn step(&mut self, event: SessionEvent) {
        for effect in self.machine.handle(event, Instant::now()) {
            self.execute(effect);
        }
        let next = self.machine.status();
        let _ = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Install a freshly opened transport if it is still wanted.
    fn complete(&mut self, completion: Completion) -> Option<SessionEvent> {
        match completion {
            Completion::Credentials { ticket, result } => {
                Some(SessionEvent::CredentialsFetched { ticket, result })
            }
            Completion::Opened {
                generation,
                result: Ok(handle),
            } => {
                if self.machine.accepts_transport(generation) {
                    self.teardown();
                    self.live = Some((generation, handle));
                    Some(SessionEvent::TransportOpened {
                        generation,
                        result: Ok(()),
                    })
                } else {
                    debug!(generation, "late transport torn down");
                    handle.teardown();
                    None
                }
            }
            Completion::Opened {
                generation,
                result: Err(e),
            } => Some(SessionEvent::TransportOpened {
                generation,
                result: Err(e),
            }),
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::FetchCredentials { ticket } => {
                let provider = Arc::clone(&self.credentials);
                let tx = self.completion_tx.clone();
                let _ = self.tasks.spawn(async move {
                    let result = provider.fetch().await;
                    let _ = tx.send(Completion::Credentials { ticket, result });
                });
            }
            Effect::OpenTransport { generation, url } => {
                self.teardown();
                let connector = Arc::clone(&self.connector);
                let tx = self.completion_tx.clone();
                let sink = EventSink::new(generation, self.transport_tx.clone());
                let timeout = self.machine.config().handshake_timeout;
                let _ = self.tasks.spawn(async move {
                    let result = match tokio::time::timeout(timeout, connector.open(&url, sink)).await {
                        Ok(result) => result,
                        Err(_) => Err(FeedError::HandshakeTimeout(timeout)),
                    };
                    let _ = tx.send(Completion::Opened { generation, result });
                });
            }
            Effect::Send(text) => self.send(Outbound::Text(text)),
            Effect::Ping(payload) => self.send(Outbound::Ping(payload)),
            Effect::Teardown => self.teardown(),
        }
    }

    fn send(&self, frame: Outbound) {
        match &self.live {
            Some((generation, handle)) => {
                if !handle.send(frame) {
                    debug!(generation, "transport gone, frame dropped");
                }
            }
            None => debug!("no live transport, frame dropped"),
        }
    }

    fn teardown(&mut self) {
        if let Some((generation, handle)) = self.live.take() {
            handle.teardown();
            debug!(generation, "transport torn down");
        }
    }
}

fn transport_event(generation: u64, event: TransportEvent) -> SessionEvent {
    match event {
        TransportEvent::Frame(payload) => SessionEvent::FrameReceived {
            generation,
            payload,
        },
        TransportEvent::Pong => SessionEvent::PongReceived { generation },
        TransportEvent::Closed(reason) => SessionEvent::TransportClosed { generation, reason },
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
