//! Connection supervision: one REST + event-stream pair, reconnected with
//! backoff whenever it drops.
//!
//! The supervisor task is the only writer of [`ConnectionStatus`]; everyone
//! else observes it through a `watch` channel.

use mattergate_channels::backend::{ChatBackend, EventStream};
use mattergate_runtime::retry::{Backoff, RetryConfig};
use mattergate_types::config::GatewayConfig;
use mattergate_types::error::ConnectError;
use mattergate_types::message::{Identity, InboundEvent, Team};
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Capacity of the inbound event fan-out.
const EVENT_BUFFER: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Observable connection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Base URL of the server being supervised.
    pub endpoint: String,
    /// Most recent connect or disconnect error.
    pub last_error: Option<String>,
    /// Consecutive failed connect attempts since the last success.
    pub failed_attempts: u32,
    pub identity: Option<Identity>,
    pub team: Option<Team>,
    /// Terminal: the supervisor has been shut down and will not reconnect.
    pub shut_down: bool,
}

impl ConnectionStatus {
    fn initial(endpoint: String) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint,
            last_error: None,
            failed_attempts: 0,
            identity: None,
            team: None,
            shut_down: false,
        }
    }

    /// The live connection, if there is one.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.identity.clone().map(|identity| ConnectionHandle {
            identity,
            team: self.team.clone(),
        })
    }
}

/// What callers learn about an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub identity: Identity,
    pub team: Option<Team>,
}

/// Inbound events, lag-tolerant.
pub type InboundEvents = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

type DisconnectCallback = Box<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Owns the connection to the chat server.
///
/// Cloning is cheap; clones share one supervisor task.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    backend: Arc<dyn ChatBackend>,
    team: Option<String>,
    reconnect: RetryConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<InboundEvent>,
    callbacks: Mutex<Vec<DisconnectCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(config: &GatewayConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::initial(config.base_url().to_string()));
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(SupervisorInner {
                backend,
                team: config.team.clone(),
                reconnect: RetryConfig::reconnect(&config.delivery),
                status_tx,
                shutdown_tx,
                events_tx,
                callbacks: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the supervisor task. Idempotent; a no-op after shutdown.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || *self.inner.shutdown_tx.borrow() {
            return;
        }
        debug!(backend = self.inner.backend.name(), "Starting connection supervisor");
        *task = Some(tokio::spawn(self.inner.clone().run()));
    }

    /// Start if needed and wait for a live connection.
    pub async fn connect(&self) -> Result<ConnectionHandle, ConnectError> {
        self.ensure_connected().await
    }

    /// Wait until the connection is up. Fails only once the supervisor has
    /// been shut down; connect failures are retried in the background.
    pub async fn ensure_connected(&self) -> Result<ConnectionHandle, ConnectError> {
        self.start();
        let mut rx = self.inner.status_tx.subscribe();
        let status = rx
            .wait_for(|s| s.state == ConnectionState::Connected || s.shut_down)
            .await
            .map_err(|_| ConnectError::Shutdown)?
            .clone();
        if status.shut_down {
            return Err(ConnectError::Shutdown);
        }
        status.handle().ok_or(ConnectError::Shutdown)
    }

    /// Register a callback run each time a live connection is lost.
    pub fn on_disconnect(&self, callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Current snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status_tx.borrow().state == ConnectionState::Connected
    }

    /// Inbound events received from now on. Events dropped because the
    /// subscriber lagged are logged and skipped.
    pub fn events(&self) -> InboundEvents {
        let stream = BroadcastStream::new(self.inner.events_tx.subscribe()).filter_map(|item| {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Inbound event subscriber lagged, events dropped");
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Stop reconnecting and close the connection. Waits for the supervisor
    /// task to finish; afterwards the state is `Disconnected` for good.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match task {
            Some(task) => {
                let _ = task.await;
            }
            None => self.inner.status_tx.send_modify(|s| {
                s.state = ConnectionState::Disconnected;
                s.shut_down = true;
            }),
        }
    }
}

impl SupervisorInner {
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new(self.reconnect.clone());
        // Failed connects since the last success; a dropped stream is not one.
        let mut failures: u32 = 0;
        let mut was_connected = false;
        let endpoint = self.status_tx.borrow().endpoint.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.status_tx
                .send_modify(|s| s.state = ConnectionState::Connecting);
            debug!(%endpoint, "Connecting");

            let attempt = tokio::select! {
                attempt = self.establish() => attempt,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            match attempt {
                Ok((handle, stream)) => {
                    backoff.reset();
                    failures = 0;
                    info!(
                        user_id = %handle.identity.user_id,
                        team = handle.team.as_ref().map(|t| t.name.as_str()).unwrap_or("-"),
                        "Connected as @{}",
                        handle.identity.username
                    );
                    self.status_tx.send_modify(|s| {
                        s.state = ConnectionState::Connected;
                        s.identity = Some(handle.identity);
                        s.team = handle.team;
                        s.failed_attempts = 0;
                        s.last_error = None;
                    });

                    let Some(reason) = self.pump(stream, &mut shutdown_rx).await else {
                        was_connected = true;
                        break;
                    };
                    warn!(%endpoint, error = %reason, "Connection lost, reconnecting");
                    self.status_tx.send_modify(|s| {
                        s.state = ConnectionState::Backoff;
                        s.last_error = Some(reason);
                    });
                    self.fire_disconnect();
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    match &err {
                        ConnectError::Unauthorized(_) | ConnectError::TeamNotFound(_) => {
                            warn!(%endpoint, attempt = failures, error = %err, "Connect failed")
                        }
                        _ => debug!(%endpoint, attempt = failures, error = %err, "Connect failed"),
                    }
                    self.status_tx.send_modify(|s| {
                        s.state = ConnectionState::Backoff;
                        s.last_error = Some(err.to_string());
                        s.failed_attempts = failures;
                    });
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        self.status_tx.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.identity = None;
            s.team = None;
            s.shut_down = true;
        });
        if was_connected {
            self.fire_disconnect();
        }
        info!(%endpoint, "Connection supervisor stopped");
    }

    /// Authenticate, pick the team, open the event stream.
    async fn establish(&self) -> Result<(ConnectionHandle, EventStream), ConnectError> {
        let identity = self.backend.authenticate().await?;
        let team = self.backend.resolve_team(self.team.as_deref()).await?;
        let stream = self.backend.open_event_stream().await?;
        Ok((ConnectionHandle { identity, team }, stream))
    }

    /// Forward events until the stream fails. `None` means shutdown.
    async fn pump(
        &self,
        mut stream: EventStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = wait_for_shutdown(shutdown_rx) => return None,
            };
            match next {
                // No subscribers is fine
                Some(Ok(event)) => {
                    let _ = self.events_tx.send(event);
                }
                Some(Err(err)) => return Some(err.to_string()),
                None => return Some("event stream closed".to_string()),
            }
        }
    }

    fn fire_disconnect(&self) {
        let status = self.status_tx.borrow().clone();
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.iter() {
            callback(&status);
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
