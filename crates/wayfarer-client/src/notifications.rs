//! Notification channel client.
//!
//! A transparent relay: server events are re-published under the same event kind
//! and no state is aggregated locally. Consumers typically react by invalidating
//! their cached notification queries.

use crate::config::ReconnectPolicy;
use crate::listeners::{Handler, Listeners, Subscription};
use crate::socket::{NotificationProtocol, ReconnectingSocket, SocketEvent, SocketEventKind};
use crate::transport::Connector;
use std::sync::Arc;
use wayfarer_core::{ConnectionState, Credential, NotificationKind, NotificationMessage};

/// What a notification listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationTopic {
    Connected,
    Disconnected,
    Event(NotificationKind),
}

impl From<NotificationKind> for NotificationTopic {
    fn from(kind: NotificationKind) -> Self {
        NotificationTopic::Event(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Notification(NotificationMessage),
}

impl NotificationEvent {
    pub fn topic(&self) -> NotificationTopic {
        match self {
            NotificationEvent::Connected => NotificationTopic::Connected,
            NotificationEvent::Disconnected { .. } => NotificationTopic::Disconnected,
            NotificationEvent::Notification(msg) => NotificationTopic::Event(msg.kind()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NotificationClient {
    socket: ReconnectingSocket<NotificationProtocol>,
    listeners: Listeners<NotificationTopic, NotificationEvent>,
}

impl NotificationClient {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let socket = ReconnectingSocket::new(connector, policy);
        let listeners = Listeners::new();

        for kind in [
            SocketEventKind::Connected,
            SocketEventKind::Disconnected,
            SocketEventKind::Message,
        ] {
            let relay = listeners.clone();
            socket.on(kind, move |event| relay_event(&relay, event)).detach();
        }

        Self { socket, listeners }
    }

    /// Open the channel. Without a credential the client stays idle.
    pub fn connect(&self, credential: Option<Credential>) {
        self.socket.connect(credential);
    }

    pub fn disconnect(&self) {
        self.socket.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.socket.state()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        self.socket.wait_for_state(target).await
    }

    /// Subscribe to `topic`; the returned handle unsubscribes this registration only.
    pub fn on(
        &self,
        topic: impl Into<NotificationTopic>,
        handler: impl Fn(&NotificationEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.add(topic.into(), Arc::new(handler))
    }

    pub fn on_handler(
        &self,
        topic: impl Into<NotificationTopic>,
        handler: Handler<NotificationEvent>,
    ) -> Subscription {
        self.listeners.add(topic.into(), handler)
    }

    /// Remove every registration of `handler` for `topic`.
    pub fn off(&self, topic: impl Into<NotificationTopic>, handler: &Handler<NotificationEvent>) -> usize {
        self.listeners.remove(topic.into(), handler)
    }
}

fn relay_event(
    listeners: &Listeners<NotificationTopic, NotificationEvent>,
    event: &SocketEvent<NotificationMessage>,
) {
    let event = match event {
        SocketEvent::Connected => NotificationEvent::Connected,
        SocketEvent::Disconnected { reason } => NotificationEvent::Disconnected {
            reason: reason.clone(),
        },
        SocketEvent::Message(msg) => {
            tracing::debug!("relaying {}", msg.kind());
            NotificationEvent::Notification(msg.clone())
        }
        SocketEvent::StateChanged(_) | SocketEvent::CredentialChanged => return,
    };
    listeners.emit(event.topic(), &event);
}
