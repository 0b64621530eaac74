//! Session module - The single owner of the transport
//!
//! One loop cycles `Advertising -> Connected -> Disconnected -> Advertising`
//! for the life of the process. Everything else talks to it through a
//! [`SessionHandle`].

mod events;
mod executor;

pub use events::*;
pub use executor::execute;

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::hid::ReportCodec;
use crate::planner::Planner;
use crate::transport::{PeerInfo, Transport, TransportError, TransportResult};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session loop has stopped")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Published session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the transport to accept a host
    Advertising { session_id: Uuid },
    Connected { session_id: Uuid, peer: PeerInfo },
    Disconnected { reason: String },
    Stopped,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Advertising { .. } => write!(f, "advertising"),
            SessionState::Connected { peer, .. } => write!(f, "connected to {}", peer),
            SessionState::Disconnected { reason } => write!(f, "disconnected ({})", reason),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Cloneable front door to the session loop
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMessage>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Run one command and wait until it has been fully sent or dropped
    pub async fn execute(&self, command: Command) -> SessionResult<CommandOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Command { command, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ask the loop to release everything and stop
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.tx
            .send(SessionMessage::Shutdown)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// How a connected period ended
enum ConnectedExit {
    LinkLost(String),
    Shutdown,
}

/// What woke the loop while advertising
enum AdvertisingWake {
    Accepted(TransportResult<PeerInfo>),
    Message(Option<SessionMessage>),
}

/// The session loop and everything it owns
pub struct SessionManager {
    transport: Box<dyn Transport>,
    planner: Planner,
    codec: ReportCodec,
    reconnect_delay: Duration,
    session_id: Uuid,
    tx: mpsc::WeakSender<SessionMessage>,
    rx: mpsc::Receiver<SessionMessage>,
    state_tx: watch::Sender<SessionState>,
}

const CHANNEL_CAPACITY: usize = 64;

impl SessionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        planner: Planner,
        codec: ReportCodec,
        reconnect_delay: Duration,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Advertising { session_id });

        let manager = Self {
            transport,
            planner,
            codec,
            reconnect_delay,
            session_id,
            tx: tx.downgrade(),
            rx,
            state_tx,
        };
        let handle = SessionHandle {
            tx,
            state: state_rx,
        };
        (manager, handle)
    }

    /// Open the transport; failure here is an initialization error
    pub async fn open(&mut self) -> SessionResult<()> {
        self.transport.open().await?;
        info!("Opened {} transport", self.transport.name());
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        info!("Session {}", state);
        self.state_tx.send_replace(state);
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) -> SessionResult<()> {
        loop {
            self.session_id = Uuid::new_v4();
            self.set_state(SessionState::Advertising {
                session_id: self.session_id,
            });

            if let Err(e) = self.transport.advertise().await {
                warn!("Advertising failed: {}", e);
            }

            let peer = match self.wait_for_peer().await {
                Some(Ok(peer)) => peer,
                Some(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    if self.pause().await {
                        continue;
                    }
                    break;
                }
                None => break,
            };

            info!("Host connected: {}", peer);
            self.set_state(SessionState::Connected {
                session_id: self.session_id,
                peer,
            });

            match self.serve_connected().await {
                ConnectedExit::Shutdown => {
                    self.release_all().await;
                    break;
                }
                ConnectedExit::LinkLost(reason) => {
                    self.teardown(reason).await;
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!("Close on shutdown failed: {}", e);
        }
        if let Err(e) = self.transport.shutdown().await {
            warn!("Transport shutdown failed: {}", e);
        }
        self.set_state(SessionState::Stopped);
        Ok(())
    }

    fn lifecycle_sender(&self) -> Option<LifecycleSender> {
        self.tx
            .upgrade()
            .map(|tx| LifecycleSender::new(self.session_id, tx))
    }

    /// Accept a host while still answering commands; `None` means stop
    async fn wait_for_peer(&mut self) -> Option<TransportResult<PeerInfo>> {
        loop {
            let events = self.lifecycle_sender()?;

            let wake = tokio::select! {
                result = self.transport.accept(events) => AdvertisingWake::Accepted(result),
                message = self.rx.recv() => AdvertisingWake::Message(message),
            };

            match wake {
                AdvertisingWake::Accepted(result) => return Some(result),
                AdvertisingWake::Message(None) | AdvertisingWake::Message(Some(SessionMessage::Shutdown)) => {
                    return None
                }
                AdvertisingWake::Message(Some(message)) => self.handle_idle_message(message),
            }
        }
    }

    /// Messages that arrive while no host is connected
    fn handle_idle_message(&self, message: SessionMessage) {
        match message {
            SessionMessage::Command { command, reply } => {
                let outcome = if command == Command::Ping {
                    CommandOutcome::Pong
                } else {
                    warn!("Dropping {}: no host connected", command);
                    CommandOutcome::NotConnected
                };
                let _ = reply.send(outcome);
            }
            SessionMessage::Lifecycle(event) => {
                debug!("Ignoring {} from session {} while idle", event.event, event.session_id);
            }
            SessionMessage::Shutdown => {}
        }
    }

    async fn serve_connected(&mut self) -> ConnectedExit {
        loop {
            let Some(message) = self.rx.recv().await else {
                return ConnectedExit::Shutdown;
            };

            match message {
                SessionMessage::Shutdown => return ConnectedExit::Shutdown,
                SessionMessage::Lifecycle(event) => {
                    if event.session_id == self.session_id {
                        return ConnectedExit::LinkLost(event.event.to_string());
                    }
                    debug!("Ignoring stale {} from session {}", event.event, event.session_id);
                }
                SessionMessage::Command { command, reply } => {
                    if command == Command::Ping {
                        let _ = reply.send(CommandOutcome::Pong);
                        continue;
                    }

                    let plan = self.planner.plan(&command);
                    match execute(plan, &self.codec, self.transport.as_mut()).await {
                        Ok(reports) => {
                            debug!("{} done, {} reports", command.verb(), reports);
                            let _ = reply.send(CommandOutcome::Executed { reports });
                        }
                        Err(e) => {
                            error!("{} failed: {}", command.verb(), e);
                            let _ = reply.send(CommandOutcome::Failed(e.to_string()));
                            return ConnectedExit::LinkLost(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Best-effort release of every key and button
    async fn release_all(&mut self) {
        let plan = self.planner.release_all();
        if let Err(e) = execute(plan, &self.codec, self.transport.as_mut()).await {
            debug!("Release-all failed: {}", e);
        }
    }

    async fn teardown(&mut self, reason: String) {
        self.set_state(SessionState::Disconnected { reason });
        self.release_all().await;
        if let Err(e) = self.transport.close().await {
            warn!("Close failed: {}", e);
        }
    }

    /// Wait out the reconnect delay; false if shutdown was requested
    async fn pause(&mut self) -> bool {
        let deadline = Instant::now() + self.reconnect_delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                message = self.rx.recv() => match message {
                    None | Some(SessionMessage::Shutdown) => return false,
                    Some(message) => self.handle_idle_message(message),
                },
            }
        }
    }
}
