//! Optimistic mutations.
//!
//! An [`OptimisticMutation`] describes which cached queries a server call affects
//! and how to predict their new value. Running it:
//!
//! 1. cancels in-flight fetches for the targeted keys
//! 2. snapshots their current values
//! 3. writes the predicted values, visible to readers immediately
//! 4. awaits the server call
//! 5. on failure, restores every snapshot exactly
//! 6. either way, invalidates the targeted keys so the store refetches server truth
//!
//! Once the prediction is written the mutation always runs to settlement; there is
//! no mid-flight cancellation and no retry.

use crate::key::{CacheKey, KeyFilter};
use crate::store::QueryStore;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub type Updater = Arc<dyn Fn(&CacheKey, &Value) -> Value + Send + Sync>;

/// Progress of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    /// Predicted values are in the store; the server call is outstanding.
    Pending,
    SettledSuccess,
    /// The server call failed and the snapshots were restored.
    SettledFailure,
    RefetchTriggered,
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationPhase::Idle => "idle",
            MutationPhase::Pending => "pending",
            MutationPhase::SettledSuccess => "settled-success",
            MutationPhase::SettledFailure => "settled-failure",
            MutationPhase::RefetchTriggered => "refetch-triggered",
        };
        f.write_str(s)
    }
}

/// The server call failed; the store has been rolled back.
#[derive(Debug, thiserror::Error)]
#[error("{mutation} rolled back: {source}")]
pub struct MutationError<E> {
    pub mutation: String,
    #[source]
    pub source: E,
    /// Keys whose snapshot was restored.
    pub restored: Vec<CacheKey>,
}

impl<E> MutationError<E> {
    pub fn into_inner(self) -> E {
        self.source
    }
}

#[derive(Clone)]
pub struct OptimisticMutation {
    name: String,
    targets: Vec<KeyFilter>,
    updater: Option<Updater>,
    invalidate: Vec<KeyFilter>,
    observer: Option<Arc<dyn Fn(MutationPhase) + Send + Sync>>,
}

impl fmt::Debug for OptimisticMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticMutation")
            .field("name", &self.name)
            .field("targets", &self.targets)
            .field("invalidate", &self.invalidate)
            .finish()
    }
}

impl OptimisticMutation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
            updater: None,
            invalidate: Vec::new(),
            observer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add keys that receive the predicted value and are refetched on settle.
    pub fn target(mut self, filter: impl Into<KeyFilter>) -> Self {
        self.targets.push(filter.into());
        self
    }

    pub fn targets(&self) -> &[KeyFilter] {
        &self.targets
    }

    /// Prediction applied to every cached target value. Targets that are not
    /// cached are left alone.
    pub fn update(mut self, updater: impl Fn(&CacheKey, &Value) -> Value + Send + Sync + 'static) -> Self {
        self.updater = Some(Arc::new(updater));
        self
    }

    /// Additional keys refetched on settle without a prediction.
    pub fn also_invalidate(mut self, filter: impl Into<KeyFilter>) -> Self {
        self.invalidate.push(filter.into());
        self
    }

    /// Called on every phase transition.
    pub fn observe(mut self, observer: impl Fn(MutationPhase) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Run the mutation against `store` with `call` as the server request.
    pub async fn run<S, F, Fut, T, E>(&self, store: &S, call: F) -> Result<T, MutationError<E>>
    where
        S: QueryStore + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut phase = Phase::new(&self.name, self.observer.as_deref());

        for filter in &self.targets {
            store.cancel_pending(filter);
        }

        let mut snapshot: Vec<(CacheKey, Option<Value>)> = Vec::new();
        for filter in &self.targets {
            for key in store.keys(filter) {
                if !snapshot.iter().any(|(k, _)| *k == key) {
                    let value = store.get(&key);
                    snapshot.push((key, value));
                }
            }
        }

        if let Some(updater) = &self.updater {
            for (key, value) in &snapshot {
                if let Some(value) = value {
                    store.set(key, updater(key, value));
                }
            }
        }
        phase.advance(MutationPhase::Pending);

        let outcome = call().await;

        let outcome = match outcome {
            Ok(output) => {
                phase.advance(MutationPhase::SettledSuccess);
                Ok(output)
            }
            Err(source) => {
                tracing::warn!(
                    "{} failed, restoring {} keys: {}",
                    self.name,
                    snapshot.len(),
                    source
                );
                let mut restored = Vec::with_capacity(snapshot.len());
                for (key, value) in snapshot {
                    match value {
                        Some(value) => store.set(&key, value),
                        None => {
                            store.remove(&key);
                        }
                    }
                    restored.push(key);
                }
                phase.advance(MutationPhase::SettledFailure);
                Err(MutationError {
                    mutation: self.name.clone(),
                    source,
                    restored,
                })
            }
        };

        for filter in self.targets.iter().chain(&self.invalidate) {
            if let Err(e) = store.invalidate(filter).await {
                tracing::warn!("{}: refetch after settle failed: {}", self.name, e);
            }
        }
        phase.advance(MutationPhase::RefetchTriggered);

        outcome
    }
}

struct Phase<'a> {
    name: &'a str,
    current: MutationPhase,
    observer: Option<&'a (dyn Fn(MutationPhase) + Send + Sync)>,
}

impl<'a> Phase<'a> {
    fn new(name: &'a str, observer: Option<&'a (dyn Fn(MutationPhase) + Send + Sync)>) -> Self {
        Self {
            name,
            current: MutationPhase::Idle,
            observer,
        }
    }

    fn advance(&mut self, next: MutationPhase) {
        debug_assert!(
            matches!(
                (self.current, next),
                (MutationPhase::Idle, MutationPhase::Pending)
                    | (MutationPhase::Pending, MutationPhase::SettledSuccess)
                    | (MutationPhase::Pending, MutationPhase::SettledFailure)
                    | (MutationPhase::SettledSuccess, MutationPhase::RefetchTriggered)
                    | (MutationPhase::SettledFailure, MutationPhase::RefetchTriggered)
            ),
            "illegal transition {} -> {}",
            self.current,
            next
        );
        tracing::debug!("{}: {} -> {}", self.name, self.current, next);
        self.current = next;
        if let Some(observer) = self.observer {
            observer(next);
        }
    }
}
