//! Process-wide access to the realtime clients.
//!
//! Each channel has exactly one client per registry. Clients are created on first
//! access, so an application that never opens the map never spawns the geo task.

use crate::config::ClientConfig;
use crate::geo::GeoClient;
use crate::notifications::NotificationClient;
use crate::position::PositionSource;
use crate::transport::{Connector, WsConnector};
use std::sync::{Arc, OnceLock};
use wayfarer_core::Credential;

pub struct RealtimeRegistry {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    source: Arc<dyn PositionSource>,
    notifications: OnceLock<NotificationClient>,
    geo: OnceLock<GeoClient>,
}

impl std::fmt::Debug for RealtimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeRegistry")
            .field("endpoint", &self.config.endpoint)
            .field("notifications", &self.notifications.get().map(|c| c.state()))
            .field("geo", &self.geo.get().map(|c| c.state()))
            .finish()
    }
}

impl RealtimeRegistry {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn PositionSource>,
    ) -> Self {
        Self {
            config,
            connector,
            source,
            notifications: OnceLock::new(),
            geo: OnceLock::new(),
        }
    }

    /// Registry talking WebSocket to `config.endpoint`.
    pub fn with_websocket(config: ClientConfig, source: Arc<dyn PositionSource>) -> Self {
        let connector = Arc::new(WsConnector::new(config.endpoint.clone()));
        Self::new(config, connector, source)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The notification client. Must first be called from within a tokio runtime.
    pub fn notifications(&self) -> &NotificationClient {
        self.notifications.get_or_init(|| {
            tracing::debug!("creating notification client");
            NotificationClient::new(Arc::clone(&self.connector), self.config.reconnect.clone())
        })
    }

    /// The geo client. Must first be called from within a tokio runtime.
    pub fn geo(&self) -> &GeoClient {
        self.geo.get_or_init(|| {
            tracing::debug!("creating geo client");
            GeoClient::new(
                Arc::clone(&self.connector),
                self.config.reconnect.clone(),
                Arc::clone(&self.source),
                self.config.geo.clone(),
            )
        })
    }

    /// Connect both channels, e.g. after sign-in or a token refresh.
    pub fn connect_all(&self, credential: Option<Credential>) {
        self.notifications().connect(credential.clone());
        self.geo().connect(credential);
    }

    /// Disconnect every client that has been created, e.g. on sign-out.
    pub fn disconnect_all(&self) {
        if let Some(client) = self.notifications.get() {
            client.disconnect();
        }
        if let Some(client) = self.geo.get() {
            client.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ManualPositionSource;
    use crate::testing::{MockConnector, credential, settle};
    use wayfarer_core::ConnectionState;

    fn registry() -> (RealtimeRegistry, Arc<MockConnector>) {
        let connector = MockConnector::new();
        let registry = RealtimeRegistry::new(
            ClientConfig::default(),
            connector.clone(),
            Arc::new(ManualPositionSource::new()),
        );
        (registry, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn accessors_return_the_same_client() {
        let (registry, connector) = registry();

        registry.notifications().connect(Some(credential("t")));
        registry.notifications().connect(Some(credential("t")));
        assert!(
            registry
                .notifications()
                .wait_for_state(ConnectionState::Connected)
                .await
        );
        settle().await;

        assert_eq!(connector.peer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_all_opens_both_channels() {
        let (registry, connector) = registry();

        registry.connect_all(Some(credential("t")));
        assert!(registry.notifications().wait_for_state(ConnectionState::Connected).await);
        assert!(registry.geo().wait_for_state(ConnectionState::Connected).await);

        assert_eq!(connector.peer_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_before_first_use_creates_nothing() {
        let (registry, connector) = registry();

        registry.disconnect_all();
        settle().await;

        assert!(registry.notifications.get().is_none());
        assert!(registry.geo.get().is_none());
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_returns_both_to_idle() {
        let (registry, _connector) = registry();

        registry.connect_all(Some(credential("t")));
        assert!(registry.geo().wait_for_state(ConnectionState::Connected).await);
        registry.disconnect_all();

        assert!(registry.notifications().wait_for_state(ConnectionState::Idle).await);
        assert!(registry.geo().wait_for_state(ConnectionState::Idle).await);
        settle().await;
        assert_eq!(registry.geo().snapshot().status, ConnectionState::Idle);
    }
}
