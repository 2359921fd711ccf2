//! Realtime clients for Wayfarer.
//!
//! Two channels are exposed, each backed by a [`ReconnectingSocket`]:
//!
//! - [`NotificationClient`] relays `notification:*` server events to subscribers.
//! - [`GeoClient`] maintains a [`GeoSnapshot`] of nearby friends and the device's
//!   own position, broadcasting the latter while connected.
//!
//! Sockets reconnect with exponential backoff until explicitly disconnected.
//! [`RealtimeRegistry`] holds one client per channel for the whole process.

mod config;
mod error;
mod geo;
mod listeners;
mod notifications;
mod position;
mod registry;
mod socket;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, GeoConfig, ReconnectPolicy};
pub use error::{ConfigError, SendError, TransportError};
pub use geo::{GeoClient, GeoSnapshot};
pub use listeners::{Handler, Listeners, Subscription};
pub use notifications::{NotificationClient, NotificationEvent, NotificationTopic};
pub use position::{
    ManualPositionSource, PollingPositionSource, PositionCallback, PositionError,
    PositionErrorCallback, PositionSource,
};
pub use registry::RealtimeRegistry;
pub use socket::{
    GeoProtocol, NotificationProtocol, Protocol, ReconnectingSocket, SocketEvent, SocketEventKind,
};
pub use transport::{Connector, Transport, WsConnector};

pub use wayfarer_core::{ConnectionState, Coordinates, Credential, FriendLocation};
