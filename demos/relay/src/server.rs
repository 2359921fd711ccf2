//! Relay server implementation.
//!
//! One WebSocket endpoint per channel: `/notifications` (bearer token required)
//! and `/geo` (anonymous allowed). The bearer token doubles as the user id.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use wayfarer_core::{
    AuthPolicy, Channel, Credential, FriendLocation, GeoInbound, GeoOutbound, NotificationKind,
    NotificationMessage, UserId,
};

type Outbox = mpsc::UnboundedSender<String>;

struct Peer {
    channel: Channel,
    user: UserId,
    outbox: Outbox,
}

/// Shared server state.
#[derive(Default)]
struct RelayState {
    next_peer: u64,
    next_notification: u64,
    peers: HashMap<u64, Peer>,
    positions: HashMap<UserId, FriendLocation>,
}

impl RelayState {
    fn register(&mut self, channel: Channel, user: UserId, outbox: Outbox) -> u64 {
        self.next_peer += 1;
        self.peers.insert(
            self.next_peer,
            Peer {
                channel,
                user,
                outbox,
            },
        );
        self.next_peer
    }

    fn unregister(&mut self, id: u64) {
        self.peers.remove(&id);
    }

    /// Drop a peer; the user's last geo connection going away also drops their
    /// position and tells everyone else.
    fn leave(&mut self, id: u64, channel: Channel, user: &UserId) {
        self.unregister(id);
        if channel == Channel::Geo && !self.on_geo(user) && self.positions.remove(user).is_some() {
            self.broadcast_geo(
                user,
                &GeoInbound::FriendOffline {
                    user_id: user.clone(),
                },
            );
        }
    }

    /// Whether `user` still has a geo connection open.
    fn on_geo(&self, user: &UserId) -> bool {
        self.peers
            .values()
            .any(|p| p.channel == Channel::Geo && &p.user == user)
    }

    fn nearby(&self, user: &UserId) -> Vec<FriendLocation> {
        self.positions
            .values()
            .filter(|f| &f.user_id != user)
            .cloned()
            .collect()
    }

    fn broadcast_geo(&self, except: &UserId, msg: &GeoInbound) {
        let Ok(frame) = serde_json::to_string(msg) else {
            return;
        };
        for peer in self.peers.values() {
            if peer.channel == Channel::Geo && &peer.user != except {
                let _ = peer.outbox.send(frame.clone());
            }
        }
    }

    /// Push a notification event to every notification connection of `user`.
    fn notify(&mut self, user: &UserId, kind: NotificationKind, mut data: serde_json::Value) -> usize {
        if kind == NotificationKind::New
            && let Some(obj) = data.as_object_mut()
        {
            self.next_notification += 1;
            obj.insert("id".into(), json!(format!("n{}", self.next_notification)));
        }
        let Ok(frame) = serde_json::to_string(&NotificationMessage::new(kind, data)) else {
            return 0;
        };
        let mut delivered = 0;
        for peer in self.peers.values() {
            if peer.channel == Channel::Notifications && &peer.user == user {
                let _ = peer.outbox.send(frame.clone());
                delivered += 1;
            }
        }
        delivered
    }

    fn notification_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .peers
            .values()
            .filter(|p| p.channel == Channel::Notifications)
            .map(|p| p.user.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

type SharedState = Arc<RwLock<RelayState>>;

pub async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let state: SharedState = Arc::new(RwLock::new(RelayState::default()));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on ws://{}", addr);

    tokio::spawn(console(state.clone()));

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, state).await {
                tracing::warn!("Connection error from {}: {}", client_addr, e);
            }
        });
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn bearer(req: &Request) -> Option<Credential> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    Credential::from_optional(value.strip_prefix("Bearer "))
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: SharedState,
) -> anyhow::Result<()> {
    let mut route = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let Some(channel) = Channel::from_path(req.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "unknown channel"));
        };
        let credential = bearer(req);
        if channel.auth_policy() == AuthPolicy::Required && credential.is_none() {
            return Err(reject(StatusCode::UNAUTHORIZED, "missing bearer token"));
        }
        route = Some((channel, credential));
        Ok(resp)
    })
    .await?;
    let Some((channel, credential)) = route else {
        anyhow::bail!("handshake completed without a route");
    };

    let user = match &credential {
        Some(credential) => UserId::new(credential.token()),
        None => UserId::new(format!("guest-{}", addr.port())),
    };
    let (sink, stream) = ws.split();
    let (outbox, inbox) = mpsc::unbounded_channel::<String>();
    let id = state.write().await.register(channel, user.clone(), outbox);
    tracing::info!("{} joined {} from {}", user, channel, addr);

    session(&state, id, channel, &user, sink, stream, inbox).await
}

/// Serve a registered peer, then unregister it however the connection ended.
async fn session<S, R>(
    state: &SharedState,
    id: u64,
    channel: Channel,
    user: &UserId,
    sink: S,
    stream: R,
    inbox: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let result = pump(state, channel, user, sink, stream, inbox).await;
    state.write().await.leave(id, channel, user);
    tracing::info!("{} left {}", user, channel);
    result
}

async fn pump<S, R>(
    state: &SharedState,
    channel: Channel,
    user: &UserId,
    mut sink: S,
    mut stream: R,
    mut inbox: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    if channel == Channel::Geo {
        let nearby = GeoInbound::FriendsNearby(state.read().await.nearby(user));
        sink.send(Message::Text(serde_json::to_string(&nearby)?.into()))
            .await?;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    _ => return Ok(()),
                };
                if let Message::Text(text) = msg
                    && channel == Channel::Geo
                {
                    handle_geo_frame(state, user, text.as_str()).await;
                }
            }

            frame = inbox.recv() => match frame {
                Some(frame) => sink.send(Message::Text(frame.into())).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn handle_geo_frame(state: &SharedState, user: &UserId, text: &str) {
    let update = match serde_json::from_str::<GeoOutbound>(text) {
        Ok(GeoOutbound::LocationUpdate(position)) => position,
        Err(e) => {
            tracing::warn!("Dropping frame from {}: {}", user, e);
            return;
        }
    };
    if !update.is_valid() {
        tracing::warn!("Ignoring out-of-range position from {}", user);
        return;
    }

    let friend = FriendLocation {
        user_id: user.clone(),
        username: user.to_string(),
        lat: update.lat,
        lng: update.lng,
    };
    let mut s = state.write().await;
    let first = s.positions.insert(user.clone(), friend.clone()).is_none();
    s.broadcast_geo(user, &GeoInbound::FriendLocation(friend));

    if first {
        tracing::info!("{} is sharing their location", user);
        for other in s.notification_users() {
            if &other != user {
                s.notify(
                    &other,
                    NotificationKind::New,
                    json!({"type": "friend_nearby", "userId": user}),
                );
            }
        }
    }
}

/// Operator commands on stdin:
///
/// ```text
/// notify <user> <text...>
/// read-all <user>
/// ```
async fn console(state: SharedState) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        let (command, user) = match (words.next(), words.next()) {
            (Some(command), Some(user)) => (command, UserId::from(user)),
            (None, _) => continue,
            _ => {
                tracing::warn!("usage: notify <user> <text> | read-all <user>");
                continue;
            }
        };
        let text = words.collect::<Vec<_>>().join(" ");

        let mut s = state.write().await;
        let delivered = match command {
            "notify" => s.notify(&user, NotificationKind::New, json!({"type": "message", "text": text})),
            "read-all" => s.notify(&user, NotificationKind::ReadAll, json!({})),
            other => {
                tracing::warn!("Unknown command: {}", other);
                continue;
            }
        };
        tracing::info!("Delivered to {} connection(s) of {}", delivered, user);
    }
}
