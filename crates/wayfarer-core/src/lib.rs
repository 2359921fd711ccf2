//! Core types for the Wayfarer realtime channels.
//!
//! This crate provides the protocol primitives shared by the socket clients and
//! the query cache: channel identity, connection state, bearer credentials, entity
//! ids and the JSON envelopes spoken on each channel. It performs no I/O.

mod credential;
mod ids;
mod location;
mod message;

pub use credential::{Credential, CredentialError};
pub use ids::{CommentId, NotificationId, PlaceId, PostId, ShortId, UserId};
pub use location::{Coordinates, FriendLocation};
pub use message::{
    Envelope, EnvelopeError, GeoInbound, GeoOutbound, NotificationKind, NotificationMessage,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state of a socket client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport and no pending retry.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport failed; a retry is scheduled.
    Error,
}

impl ConnectionState {
    /// Whether a transport is live or being established (including a scheduled retry).
    pub fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Whether a channel accepts connections without a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    /// A missing credential leaves the client idle.
    Required,
    /// Anonymous sessions are allowed.
    Optional,
}

/// A logical realtime topic backed by one persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Notifications,
    Geo,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Notifications, Channel::Geo];

    /// Channel served at a request path such as `/geo`.
    pub fn from_path(path: &str) -> Option<Channel> {
        let segment = path.trim_matches('/');
        Channel::ALL.into_iter().find(|c| c.path() == segment)
    }

    /// URL path segment the channel is served on.
    pub fn path(self) -> &'static str {
        match self {
            Channel::Notifications => "notifications",
            Channel::Geo => "geo",
        }
    }

    pub fn auth_policy(self) -> AuthPolicy {
        match self {
            Channel::Notifications => AuthPolicy::Required,
            Channel::Geo => AuthPolicy::Optional,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}
