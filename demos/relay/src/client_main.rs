//! Companion client for the relay.
//!
//! Connects both channels through a `RealtimeRegistry`, walks a small circle
//! around the starting point and logs every geo snapshot and notification.
//!
//! Run (after starting `wayfarer-relay`):
//!   cargo run -p wayfarer-demo-relay --bin wayfarer-relay-client -- --token alice
//!   cargo run -p wayfarer-demo-relay --bin wayfarer-relay-client -- --token bob --lat 48.86

use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wayfarer_cache::{CacheKey, MemoryStore, NotificationScope, QueryStore, notification_invalidations};
use wayfarer_client::{
    ClientConfig, Coordinates, Credential, NotificationEvent, NotificationTopic,
    PollingPositionSource, RealtimeRegistry,
};
use wayfarer_core::NotificationKind;

#[derive(Parser, Debug)]
#[command(name = "wayfarer-relay-client", about = "Drive the Wayfarer realtime clients")]
struct Args {
    /// TOML client configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured endpoint
    #[arg(long, env = "WAYFARER_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token; without one only the geo channel connects
    #[arg(long, env = "WAYFARER_TOKEN")]
    token: Option<String>,

    #[arg(long, default_value_t = 48.8566, allow_negative_numbers = true)]
    lat: f64,

    #[arg(long, default_value_t = 2.3522, allow_negative_numbers = true)]
    lng: f64,

    /// How often the simulated device reports a position
    #[arg(long, default_value_t = 1000)]
    sample_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("wayfarer_relay_client=info".parse()?)
                .add_directive("wayfarer_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    let origin = Coordinates::new(args.lat, args.lng);
    let step = AtomicU64::new(0);
    let source = PollingPositionSource::new(Duration::from_millis(args.sample_ms), move || {
        let angle = step.fetch_add(1, Ordering::Relaxed) as f64 / 10.0;
        Ok(Coordinates::new(
            origin.lat + 0.001 * angle.sin(),
            origin.lng + 0.001 * angle.cos(),
        ))
    });
    let registry = RealtimeRegistry::with_websocket(config, Arc::new(source));

    let store = Arc::new(MemoryStore::new());
    store.set(&CacheKey::Notifications(NotificationScope::All), json!([]));
    store.set(&CacheKey::NotificationCount, json!({"count": 0}));

    for kind in NotificationKind::ALL {
        let store = store.clone();
        registry
            .notifications()
            .on(kind, move |event| {
                let NotificationEvent::Notification(msg) = event else {
                    return;
                };
                tracing::info!("{}: {}", msg.kind(), msg.payload());
                let store = store.clone();
                let filters = notification_invalidations(msg.kind());
                tokio::spawn(async move {
                    for filter in &filters {
                        if let Err(e) = store.invalidate(filter).await {
                            tracing::warn!("Invalidating {} failed: {}", filter, e);
                        }
                    }
                    tracing::info!(
                        "Notification count stale: {}",
                        store.is_stale(&CacheKey::NotificationCount)
                    );
                });
            })
            .detach();
    }
    registry
        .notifications()
        .on(NotificationTopic::Disconnected, |event| {
            tracing::info!("Notifications: {:?}", event);
        })
        .detach();

    let _snapshots = registry.geo().on_snapshot(|s| {
        tracing::info!(
            "Geo {}: me={:?} friends={} error={:?}",
            s.status,
            s.my_position,
            s.friends.len(),
            s.error
        );
    });

    registry.connect_all(Credential::from_optional(args.token.as_deref()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    registry.disconnect_all();
    // give the socket tasks a moment to send their close frames
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
