//! Local positioning sources.
//!
//! The geo client only needs `watch(on_position, on_error) -> stop handle`, so any
//! platform location API can be adapted. Two implementations ship here:
//! [`ManualPositionSource`], fed explicitly, and [`PollingPositionSource`], which
//! samples a provider function at a fixed interval.

use crate::listeners::{Listeners, Subscription};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use wayfarer_core::Coordinates;

pub type PositionCallback = Box<dyn Fn(Coordinates) + Send + Sync>;
pub type PositionErrorCallback = Box<dyn Fn(PositionError) + Send + Sync>;

/// Why a position could not be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum PositionError {
    #[error("permission_denied")]
    PermissionDenied,
    #[error("position_unavailable")]
    Unavailable,
    #[error("timeout")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// A source of device coordinates.
pub trait PositionSource: Send + Sync + 'static {
    /// Start watching. Callbacks stop when the returned handle is dropped.
    fn watch(&self, on_position: PositionCallback, on_error: PositionErrorCallback) -> Subscription;
}

/// A source whose readings are pushed by the embedding application.
#[derive(Clone, Default)]
pub struct ManualPositionSource {
    watchers: Listeners<(), Result<Coordinates, PositionError>>,
}

impl fmt::Debug for ManualPositionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualPositionSource")
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

impl ManualPositionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, position: Coordinates) {
        self.watchers.emit((), &Ok(position));
    }

    pub fn fail(&self, error: PositionError) {
        self.watchers.emit((), &Err(error));
    }

    /// Number of active watches.
    pub fn watchers(&self) -> usize {
        self.watchers.len()
    }
}

impl PositionSource for ManualPositionSource {
    fn watch(&self, on_position: PositionCallback, on_error: PositionErrorCallback) -> Subscription {
        self.watchers.add(
            (),
            Arc::new(move |reading: &Result<Coordinates, PositionError>| match reading {
                Ok(position) => on_position(*position),
                Err(error) => on_error(error.clone()),
            }),
        )
    }
}

/// Samples `provider` every `period` while watched. Requires a tokio runtime.
pub struct PollingPositionSource<F> {
    period: Duration,
    provider: Arc<F>,
}

impl<F> PollingPositionSource<F>
where
    F: Fn() -> Result<Coordinates, PositionError> + Send + Sync + 'static,
{
    pub fn new(period: Duration, provider: F) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            provider: Arc::new(provider),
        }
    }
}

impl<F> PositionSource for PollingPositionSource<F>
where
    F: Fn() -> Result<Coordinates, PositionError> + Send + Sync + 'static,
{
    fn watch(&self, on_position: PositionCallback, on_error: PositionErrorCallback) -> Subscription {
        let provider = Arc::clone(&self.provider);
        let period = self.period;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match provider() {
                    Ok(position) => on_position(position),
                    Err(error) => on_error(error),
                }
            }
        });
        Subscription::new(move || task.abort())
    }
}
