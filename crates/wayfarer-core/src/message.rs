//! Channel messages.
//!
//! Every frame on the wire is an [`Envelope`]: `{"event": "<name>", "data": <payload>}`.
//! Each channel converts envelopes into a closed enum so dispatch is an exhaustive
//! `match` instead of string comparison.

use crate::{Coordinates, FriendLocation, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Raw framing shared by all channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Error converting an envelope into a channel message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
}

impl EnvelopeError {
    fn invalid(event: &str, err: serde_json::Error) -> Self {
        Self::InvalidPayload {
            event: event.to_string(),
            reason: err.to_string(),
        }
    }
}

// ── Notifications ───────────────────────────────────────────────────

/// The three server events on the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    New,
    Read,
    ReadAll,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 3] = [
        NotificationKind::New,
        NotificationKind::Read,
        NotificationKind::ReadAll,
    ];

    pub fn event_name(self) -> &'static str {
        match self {
            NotificationKind::New => "notification:new",
            NotificationKind::Read => "notification:read",
            NotificationKind::ReadAll => "notification:read-all",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

impl FromStr for NotificationKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationKind::ALL
            .into_iter()
            .find(|k| k.event_name() == s)
            .ok_or_else(|| EnvelopeError::UnknownEvent(s.to_string()))
    }
}

/// A notification-channel event. Payloads are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum NotificationMessage {
    New(Value),
    Read(Value),
    ReadAll(Value),
}

impl NotificationMessage {
    pub fn new(kind: NotificationKind, payload: Value) -> Self {
        match kind {
            NotificationKind::New => Self::New(payload),
            NotificationKind::Read => Self::Read(payload),
            NotificationKind::ReadAll => Self::ReadAll(payload),
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::New(_) => NotificationKind::New,
            Self::Read(_) => NotificationKind::Read,
            Self::ReadAll(_) => NotificationKind::ReadAll,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::New(v) | Self::Read(v) | Self::ReadAll(v) => v,
        }
    }
}

impl TryFrom<Envelope> for NotificationMessage {
    type Error = EnvelopeError;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        let kind: NotificationKind = env.event.parse()?;
        Ok(Self::new(kind, env.data))
    }
}

impl From<NotificationMessage> for Envelope {
    fn from(msg: NotificationMessage) -> Self {
        let kind = msg.kind();
        let data = match msg {
            NotificationMessage::New(v)
            | NotificationMessage::Read(v)
            | NotificationMessage::ReadAll(v) => v,
        };
        Envelope::new(kind.event_name(), data)
    }
}

// ── Geo ─────────────────────────────────────────────────────────────

const FRIEND_LOCATION: &str = "friend:location";
const FRIEND_OFFLINE: &str = "friend:offline";
const FRIENDS_NEARBY: &str = "friends:nearby";
const LOCATION_UPDATE: &str = "location:update";

/// Server -> client messages on the geo channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum GeoInbound {
    /// A peer moved; upsert by user id.
    FriendLocation(FriendLocation),
    /// A peer went offline.
    FriendOffline { user_id: UserId },
    /// Full list of visible peers, sent after (re)connecting.
    FriendsNearby(Vec<FriendLocation>),
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfflinePayload {
    user_id: UserId,
}

impl TryFrom<Envelope> for GeoInbound {
    type Error = EnvelopeError;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        let Envelope { event, data } = env;
        match event.as_str() {
            FRIEND_LOCATION => serde_json::from_value(data)
                .map(GeoInbound::FriendLocation)
                .map_err(|e| EnvelopeError::invalid(&event, e)),
            FRIEND_OFFLINE => serde_json::from_value::<OfflinePayload>(data)
                .map(|p| GeoInbound::FriendOffline { user_id: p.user_id })
                .map_err(|e| EnvelopeError::invalid(&event, e)),
            FRIENDS_NEARBY => serde_json::from_value(data)
                .map(GeoInbound::FriendsNearby)
                .map_err(|e| EnvelopeError::invalid(&event, e)),
            _ => Err(EnvelopeError::UnknownEvent(event)),
        }
    }
}

impl From<GeoInbound> for Envelope {
    fn from(msg: GeoInbound) -> Self {
        let (event, data) = match msg {
            GeoInbound::FriendLocation(f) => (FRIEND_LOCATION, serde_json::to_value(f)),
            GeoInbound::FriendOffline { user_id } => {
                (FRIEND_OFFLINE, serde_json::to_value(OfflinePayload { user_id }))
            }
            GeoInbound::FriendsNearby(list) => (FRIENDS_NEARBY, serde_json::to_value(list)),
        };
        Envelope::new(event, data.unwrap_or_default())
    }
}

/// Client -> server messages on the geo channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum GeoOutbound {
    LocationUpdate(Coordinates),
}

impl TryFrom<Envelope> for GeoOutbound {
    type Error = EnvelopeError;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        match env.event.as_str() {
            LOCATION_UPDATE => serde_json::from_value(env.data)
                .map(GeoOutbound::LocationUpdate)
                .map_err(|e| EnvelopeError::invalid(LOCATION_UPDATE, e)),
            _ => Err(EnvelopeError::UnknownEvent(env.event)),
        }
    }
}

impl From<GeoOutbound> for Envelope {
    fn from(msg: GeoOutbound) -> Self {
        match msg {
            GeoOutbound::LocationUpdate(c) => {
                Envelope::new(LOCATION_UPDATE, serde_json::to_value(c).unwrap_or_default())
            }
        }
    }
}
