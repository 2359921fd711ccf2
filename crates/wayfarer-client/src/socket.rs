//! Reconnecting socket.
//!
//! [`ReconnectingSocket`] is a cheap handle to a background actor task that owns
//! the transport for one channel. `connect`, `disconnect` and `send` only queue a
//! command, so they never block and may be called from inside an event handler.
//! The actor processes commands and transport frames one at a time, which gives
//! every subscriber of a socket a single, ordered view of its events.
//!
//! Lifecycle:
//! 1. `Idle` until a `connect` with an acceptable credential arrives
//! 2. `Connecting` while the connector performs the handshake
//! 3. `Connected`: frames are decoded and fanned out; outbound messages are written
//! 4. On failure, `Error` plus a backoff sleep, then back to 2
//! 5. `disconnect` from any state cancels the handshake, the live transport or the
//!    pending retry and returns to `Idle`

use crate::config::ReconnectPolicy;
use crate::error::SendError;
use crate::listeners::{Handler, Listeners, Subscription};
use crate::transport::{Connector, Transport};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use wayfarer_core::{
    AuthPolicy, Channel, ConnectionState, Credential, GeoInbound, GeoOutbound, NotificationMessage,
};

/// Message types spoken on a channel.
pub trait Protocol: Send + Sync + 'static {
    type Inbound: DeserializeOwned + Send + Sync + 'static;
    type Outbound: Serialize + Send + 'static;

    const CHANNEL: Channel;
}

/// The notification channel: inbound events only.
#[derive(Debug)]
pub struct NotificationProtocol;

impl Protocol for NotificationProtocol {
    type Inbound = NotificationMessage;
    type Outbound = ();

    const CHANNEL: Channel = Channel::Notifications;
}

/// The geo channel.
#[derive(Debug)]
pub struct GeoProtocol;

impl Protocol for GeoProtocol {
    type Inbound = GeoInbound;
    type Outbound = GeoOutbound;

    const CHANNEL: Channel = Channel::Geo;
}

/// Events published by a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent<M> {
    StateChanged(ConnectionState),
    /// A handshake completed.
    Connected,
    /// A live connection ended, for any reason.
    Disconnected { reason: Option<String> },
    /// `connect` was called with a different credential while the socket was
    /// active. Emitted before the old connection is torn down; anything derived
    /// from the previous session is stale.
    CredentialChanged,
    /// A decoded inbound frame.
    Message(M),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    StateChanged,
    Connected,
    Disconnected,
    CredentialChanged,
    Message,
}

impl<M> SocketEvent<M> {
    pub fn kind(&self) -> SocketEventKind {
        match self {
            SocketEvent::StateChanged(_) => SocketEventKind::StateChanged,
            SocketEvent::Connected => SocketEventKind::Connected,
            SocketEvent::Disconnected { .. } => SocketEventKind::Disconnected,
            SocketEvent::CredentialChanged => SocketEventKind::CredentialChanged,
            SocketEvent::Message(_) => SocketEventKind::Message,
        }
    }
}

enum Command<O> {
    Connect(Option<Credential>),
    Disconnect,
    Send(O),
}

struct Shared<P: Protocol> {
    cmd_tx: mpsc::UnboundedSender<Command<P::Outbound>>,
    state_rx: watch::Receiver<ConnectionState>,
    listeners: Listeners<SocketEventKind, SocketEvent<P::Inbound>>,
}

/// Handle to the single connection of channel `P`. Clones share the connection.
pub struct ReconnectingSocket<P: Protocol> {
    shared: Arc<Shared<P>>,
}

impl<P: Protocol> Clone for ReconnectingSocket<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Protocol> std::fmt::Debug for ReconnectingSocket<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSocket")
            .field("channel", &P::CHANNEL)
            .field("state", &self.state())
            .finish()
    }
}

impl<P: Protocol> ReconnectingSocket<P> {
    /// Spawn the socket actor. Must be called from within a tokio runtime.
    ///
    /// The actor exits once every handle has been dropped.
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let listeners = Listeners::new();

        let actor = Actor::<P> {
            connector,
            policy,
            cmd_rx,
            state_tx,
            listeners: listeners.clone(),
            credential: None,
            attempt: 0,
        };
        tokio::spawn(actor.run());

        Self {
            shared: Arc::new(Shared {
                cmd_tx,
                state_rx,
                listeners,
            }),
        }
    }

    pub fn channel(&self) -> Channel {
        P::CHANNEL
    }

    /// Open the channel with `credential`.
    ///
    /// A no-op while already connecting or connected with the same credential. A
    /// different credential replaces the current connection. On channels that
    /// require authentication, `None` leaves the socket idle.
    pub fn connect(&self, credential: Option<Credential>) {
        self.command(Command::Connect(credential));
    }

    /// Close the transport and cancel any scheduled retry. Subscriptions survive.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Queue `message` for the live transport.
    pub fn send(&self, message: P::Outbound) -> Result<(), SendError> {
        if self.state() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        self.shared
            .cmd_tx
            .send(Command::Send(message))
            .map_err(|_| SendError::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    /// Wait until the socket reaches `target`. Returns `false` if the actor is gone.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let mut rx = self.shared.state_rx.clone();
        rx.wait_for(|s| *s == target).await.is_ok()
    }

    /// Subscribe to events of `kind`.
    pub fn on(
        &self,
        kind: SocketEventKind,
        handler: impl Fn(&SocketEvent<P::Inbound>) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.listeners.add(kind, Arc::new(handler))
    }

    pub fn on_handler(
        &self,
        kind: SocketEventKind,
        handler: Handler<SocketEvent<P::Inbound>>,
    ) -> Subscription {
        self.shared.listeners.add(kind, handler)
    }

    /// Remove every registration of `handler` for `kind`.
    pub fn off(&self, kind: SocketEventKind, handler: &Handler<SocketEvent<P::Inbound>>) -> usize {
        self.shared.listeners.remove(kind, handler)
    }

    fn command(&self, cmd: Command<P::Outbound>) {
        if self.shared.cmd_tx.send(cmd).is_err() {
            tracing::warn!("{} socket task has shut down", P::CHANNEL);
        }
    }
}

// ── Actor ───────────────────────────────────────────────────────────

enum Phase {
    Idle,
    Connecting,
    Live(Box<dyn Transport>),
    Backoff(Duration),
    Shutdown,
}

/// What a command means for the current phase.
enum Decision<O> {
    Ignore,
    /// (Re)open with the stored credential.
    Restart,
    /// Return to idle.
    Stop,
    Send(O),
    Shutdown,
}

struct Actor<P: Protocol> {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    cmd_rx: mpsc::UnboundedReceiver<Command<P::Outbound>>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Listeners<SocketEventKind, SocketEvent<P::Inbound>>,
    credential: Option<Credential>,
    attempt: u32,
}

impl<P: Protocol> Actor<P> {
    async fn run(mut self) {
        tracing::debug!("{} socket task started", P::CHANNEL);
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connecting => self.connecting().await,
                Phase::Live(transport) => self.live(transport).await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Shutdown => break,
            };
        }
        self.set_state(ConnectionState::Idle);
        tracing::debug!("{} socket task exited", P::CHANNEL);
    }

    async fn idle(&mut self) -> Phase {
        loop {
            let cmd = self.cmd_rx.recv().await;
            match self.decide(cmd) {
                Decision::Restart => return Phase::Connecting,
                Decision::Shutdown => return Phase::Shutdown,
                Decision::Send(_) => tracing::debug!("{}: dropping message while idle", P::CHANNEL),
                Decision::Ignore | Decision::Stop => {}
            }
        }
    }

    async fn connecting(&mut self) -> Phase {
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let credential = self.credential.clone();
        let connect = async move { connector.connect(P::CHANNEL, credential.as_ref()).await };
        tokio::pin!(connect);

        loop {
            tokio::select! {
                res = &mut connect => {
                    return match res {
                        Ok(transport) => {
                            tracing::info!("{} connected", P::CHANNEL);
                            self.attempt = 0;
                            self.set_state(ConnectionState::Connected);
                            self.emit(SocketEvent::Connected);
                            Phase::Live(transport)
                        }
                        Err(e) => {
                            tracing::warn!("{} connect failed: {}", P::CHANNEL, e);
                            self.fail()
                        }
                    };
                }
                cmd = self.cmd_rx.recv() => match self.decide(cmd) {
                    Decision::Ignore => {}
                    Decision::Send(_) => {
                        tracing::debug!("{}: dropping message while connecting", P::CHANNEL)
                    }
                    // the pending handshake is dropped with this frame
                    Decision::Restart => return Phase::Connecting,
                    Decision::Stop => {
                        self.set_state(ConnectionState::Idle);
                        return Phase::Idle;
                    }
                    Decision::Shutdown => return Phase::Shutdown,
                },
            }
        }
    }

    async fn live(&mut self, mut transport: Box<dyn Transport>) -> Phase {
        loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => {
                        tracing::warn!("{} connection lost: {}", P::CHANNEL, e);
                        self.emit(SocketEvent::Disconnected { reason: Some(e.to_string()) });
                        return self.fail();
                    }
                    None => {
                        tracing::info!("{} closed by server", P::CHANNEL);
                        self.emit(SocketEvent::Disconnected {
                            reason: Some("closed by server".to_string()),
                        });
                        return self.fail();
                    }
                },
                cmd = self.cmd_rx.recv() => match self.decide(cmd) {
                    Decision::Ignore => {}
                    Decision::Send(message) => match serde_json::to_string(&message) {
                        Ok(json) => {
                            if let Err(e) = transport.send(json).await {
                                tracing::warn!("{} send failed: {}", P::CHANNEL, e);
                                self.emit(SocketEvent::Disconnected { reason: Some(e.to_string()) });
                                return self.fail();
                            }
                        }
                        Err(e) => tracing::error!("{}: failed to encode message: {}", P::CHANNEL, e),
                    },
                    Decision::Restart => {
                        close(&mut transport).await;
                        self.emit(SocketEvent::Disconnected {
                            reason: Some("credential changed".to_string()),
                        });
                        return Phase::Connecting;
                    }
                    Decision::Stop => {
                        close(&mut transport).await;
                        tracing::info!("{} disconnected", P::CHANNEL);
                        self.set_state(ConnectionState::Idle);
                        self.emit(SocketEvent::Disconnected {
                            reason: Some("client disconnect".to_string()),
                        });
                        return Phase::Idle;
                    }
                    Decision::Shutdown => {
                        close(&mut transport).await;
                        self.set_state(ConnectionState::Idle);
                        self.emit(SocketEvent::Disconnected {
                            reason: Some("client shut down".to_string()),
                        });
                        return Phase::Shutdown;
                    }
                },
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Phase::Connecting,
                cmd = self.cmd_rx.recv() => match self.decide(cmd) {
                    Decision::Ignore => {}
                    Decision::Send(_) => {
                        tracing::debug!("{}: dropping message while reconnecting", P::CHANNEL)
                    }
                    Decision::Restart => return Phase::Connecting,
                    Decision::Stop => {
                        tracing::info!("{} retry cancelled", P::CHANNEL);
                        self.set_state(ConnectionState::Idle);
                        return Phase::Idle;
                    }
                    Decision::Shutdown => return Phase::Shutdown,
                },
            }
        }
    }

    fn decide(&mut self, cmd: Option<Command<P::Outbound>>) -> Decision<P::Outbound> {
        let Some(cmd) = cmd else {
            return Decision::Shutdown;
        };
        let active = self.state().is_active();
        match cmd {
            Command::Connect(None) if P::CHANNEL.auth_policy() == AuthPolicy::Required => {
                tracing::debug!("{}: no credential, staying idle", P::CHANNEL);
                self.credential = None;
                if active { Decision::Stop } else { Decision::Ignore }
            }
            Command::Connect(credential) => {
                if active && credential == self.credential {
                    return Decision::Ignore;
                }
                if active {
                    self.emit(SocketEvent::CredentialChanged);
                }
                self.credential = credential;
                self.attempt = 0;
                Decision::Restart
            }
            Command::Disconnect => {
                if active { Decision::Stop } else { Decision::Ignore }
            }
            Command::Send(message) => Decision::Send(message),
        }
    }

    /// Record a failed attempt and schedule the next one.
    fn fail(&mut self) -> Phase {
        self.set_state(ConnectionState::Error);
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        tracing::info!(
            "{} reconnecting in {}ms (attempt {})",
            P::CHANNEL,
            delay.as_millis(),
            self.attempt
        );
        Phase::Backoff(delay)
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<P::Inbound>(text) {
            Ok(message) => self.emit(SocketEvent::Message(message)),
            Err(e) => tracing::warn!("{}: dropping malformed frame: {}", P::CHANNEL, e),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state() == state {
            return;
        }
        self.state_tx.send_replace(state);
        self.emit(SocketEvent::StateChanged(state));
    }

    fn emit(&self, event: SocketEvent<P::Inbound>) {
        self.listeners.emit(event.kind(), &event);
    }
}

async fn close(transport: &mut Box<dyn Transport>) {
    if let Err(e) = transport.close().await {
        tracing::debug!("error closing transport: {}", e);
    }
}
