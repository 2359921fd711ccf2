//! Client configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! endpoint = "wss://realtime.example.com"
//!
//! [reconnect]
//! initial_delay_ms = 500
//! max_delay_ms = 20000
//!
//! [geo]
//! broadcast_interval_ms = 3000
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base WebSocket URL; the channel path is appended.
    pub endpoint: String,
    pub reconnect: ReconnectPolicy,
    pub geo: GeoConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080".to_string(),
            reconnect: ReconnectPolicy::default(),
            geo: GeoConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that always waits `delay`.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis().min(u64::MAX as u128) as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (zero-based). Never exceeds `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// How often the latest local position is sent to the server.
    pub broadcast_interval_ms: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 5_000,
        }
    }
}

impl GeoConfig {
    pub fn broadcast_interval(&self) -> Duration {
        // tokio intervals reject a zero period
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }
}
