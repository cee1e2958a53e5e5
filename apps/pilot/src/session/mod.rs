//! The single live connection to the control server.
//!
//! `connect` spawns a driver task that owns the socket. The driver reports
//! lifecycle and inbound frames through a bounded channel that the owner loop
//! drains once per tick, and publishes the session state on a `watch` channel
//! so transfer tasks can notice a dropped connection while they wait on I/O.

use futures_util::{SinkExt, StreamExt};
use pilot_proto::{normalize_username, OutboundEnvelope};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::epoch_millis;

mod dialer;

pub use dialer::{Dialer, MutualTlsDialer, WsStream};

pub const DEFAULT_EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Url,
    /// User label; normalized into the `userId` of every outbound envelope.
    pub label: String,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub event_queue: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ServerTrustInvalid,
    Handshake,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("endpoint {0} is not a wss:// url")]
    InsecureEndpoint(String),
    #[error("server trust evaluation failed: {0}")]
    ServerTrustInvalid(String),
    #[error("client credentials unusable: {0}")]
    Credentials(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl SessionError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            SessionError::ServerTrustInvalid(_) => FailureReason::ServerTrustInvalid,
            SessionError::Transport(_) | SessionError::NotConnected => FailureReason::Transport,
            _ => FailureReason::Handshake,
        }
    }
}

/// What the driver hands to the owner loop, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Message(String),
    Closed,
    Error(String),
}

/// The outbound half every subsystem talks through.
pub trait ControlChannel {
    fn user_id(&self) -> &str;
    fn session_id(&self) -> &str;
    fn state(&self) -> SessionState;
    fn subscribe_state(&self) -> watch::Receiver<SessionState>;
    fn send_envelope(&self, envelope: &OutboundEnvelope) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }
}

pub fn connection_id(user_id: &str, epoch_ms: i64) -> String {
    format!("{user_id}-{epoch_ms}")
}

/// Starts a session. The returned handle is `Connecting`; the outcome arrives
/// on `events` as `Connected` or `Error`.
pub fn connect(
    config: &SessionConfig,
    dialer: Arc<dyn Dialer>,
    events: mpsc::Sender<SessionEvent>,
) -> SessionHandle {
    let user_id = normalize_username(&config.label);
    let connection_id = connection_id(&user_id, epoch_millis());
    let (state_tx, _) = watch::channel(SessionState::Connecting);
    let state = Arc::new(state_tx);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    info!(
        target: "pilot::session",
        endpoint = %config.endpoint,
        connection_id = %connection_id,
        "connecting"
    );

    let driver = Driver {
        endpoint: config.endpoint.clone(),
        dialer,
        state: Arc::clone(&state),
        events,
        outbound: outbound_rx,
        heartbeat: config.heartbeat,
        user_id: user_id.clone(),
        connection_id: connection_id.clone(),
    };
    let task = tokio::spawn(driver.run());

    SessionHandle {
        endpoint: config.endpoint.clone(),
        user_id,
        connection_id,
        state,
        outbound: outbound_tx,
        driver: Some(task),
    }
}

pub struct SessionHandle {
    endpoint: Url,
    user_id: String,
    connection_id: String,
    state: Arc<watch::Sender<SessionState>>,
    outbound: mpsc::UnboundedSender<String>,
    driver: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queues a text frame. Never buffers for later: a session that is not
    /// `Connected` rejects the frame.
    pub fn send(&self, text: String) -> Result<(), SessionError> {
        let state = self.state.borrow().clone();
        if state != SessionState::Connected {
            warn!(
                target: "pilot::session",
                connection_id = %self.connection_id,
                state = ?state,
                "dropping outbound frame; session not connected"
            );
            return Err(SessionError::NotConnected);
        }
        self.outbound
            .send(text)
            .map_err(|_| SessionError::NotConnected)
    }

    /// Moves to `Closed` and releases the socket. Safe to call repeatedly.
    /// A session that already ended keeps its terminal state, including the
    /// failure reason.
    pub fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if self.state.borrow().is_terminal() {
            return;
        }
        self.state.send_replace(SessionState::Closing);
        self.state.send_replace(SessionState::Closed);
        info!(
            target: "pilot::session",
            connection_id = %self.connection_id,
            "session closed"
        );
    }
}

impl ControlChannel for SessionHandle {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn session_id(&self) -> &str {
        &self.connection_id
    }

    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn send_envelope(&self, envelope: &OutboundEnvelope) -> Result<(), SessionError> {
        let text = envelope
            .to_json()
            .map_err(|err| SessionError::Encode(err.to_string()))?;
        self.send(text)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if !self.state.borrow().is_terminal() {
            self.state.send_replace(SessionState::Closed);
        }
    }
}

// Roughly thirty years out; a heartbeat past this never fires.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

enum Ended {
    Closed,
    ListenerGone,
    Failed(SessionError),
}

struct Driver {
    endpoint: Url,
    dialer: Arc<dyn Dialer>,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    heartbeat: Duration,
    user_id: String,
    connection_id: String,
}

impl Driver {
    async fn run(mut self) {
        let stream = match self.dialer.dial(&self.endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(err).await;
                return;
            }
        };

        // close() may have won the race against the handshake.
        let promoted = self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        });
        if !promoted {
            return;
        }
        info!(
            target: "pilot::session",
            connection_id = %self.connection_id,
            "connected"
        );
        if self.events.send(SessionEvent::Connected).await.is_err() {
            return;
        }

        match self.pump(stream).await {
            Ended::Closed => {
                self.state.send_replace(SessionState::Closed);
                info!(
                    target: "pilot::session",
                    connection_id = %self.connection_id,
                    "server closed the session"
                );
                let _ = self.events.send(SessionEvent::Closed).await;
            }
            Ended::ListenerGone => {
                self.state.send_replace(SessionState::Closed);
                debug!(
                    target: "pilot::session",
                    connection_id = %self.connection_id,
                    "event listener dropped; closing"
                );
            }
            Ended::Failed(err) => self.fail(err).await,
        }
    }

    async fn pump(&mut self, stream: WsStream) -> Ended {
        let (mut sink, mut source) = stream.split();
        let first_ping = Instant::now()
            .checked_add(self.heartbeat)
            .unwrap_or_else(far_future);
        let mut heartbeat = interval_at(first_ping, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.events.send(SessionEvent::Message(text)).await.is_err() {
                            return Ended::ListenerGone;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if self.events.send(SessionEvent::Message(text)).await.is_err() {
                                return Ended::ListenerGone;
                            }
                        }
                        Err(err) => {
                            debug!(
                                target: "pilot::session",
                                error = %err,
                                "dropping non-utf8 binary frame"
                            );
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return Ended::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Ended::Failed(SessionError::Transport(err.to_string())),
                },
                outbound = self.outbound.recv() => match outbound {
                    Some(text) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            return Ended::Failed(SessionError::Transport(err.to_string()));
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ended::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    let ping = OutboundEnvelope::ping(&self.user_id, &self.connection_id, epoch_millis());
                    match ping.to_json() {
                        Ok(text) => {
                            if let Err(err) = sink.send(Message::Text(text)).await {
                                return Ended::Failed(SessionError::Transport(err.to_string()));
                            }
                        }
                        Err(err) => warn!(target: "pilot::session", error = %err, "failed to encode ping"),
                    }
                }
            }
        }
    }

    async fn fail(&self, err: SessionError) {
        self.state
            .send_replace(SessionState::Failed(err.failure_reason()));
        error!(
            target: "pilot::session",
            connection_id = %self.connection_id,
            endpoint = %self.endpoint,
            error = %err,
            "session failed"
        );
        let _ = self.events.send(SessionEvent::Error(err.to_string())).await;
    }
}
