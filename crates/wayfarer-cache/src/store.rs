//! Query store.
//!
//! A [`QueryStore`] maps [`CacheKey`]s to JSON values and knows how to refetch
//! them. The optimistic mutation primitive only relies on this trait, so any
//! key-value store with refetch semantics can back it.

use crate::key::{CacheKey, KeyFilter};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("no fetcher configured for {0}")]
    NoFetcher(CacheKey),
    #[error("fetching {key} failed: {reason}")]
    Failed { key: CacheKey, reason: String },
}

/// Loads the server's current value for a key.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, FetchError>;
}

#[async_trait]
pub trait QueryStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Value>;

    fn set(&self, key: &CacheKey, value: Value);

    fn remove(&self, key: &CacheKey) -> Option<Value>;

    /// Cached keys selected by `filter`.
    fn keys(&self, filter: &KeyFilter) -> Vec<CacheKey>;

    /// Discard the result of any in-flight fetch for keys selected by `filter`.
    fn cancel_pending(&self, filter: &KeyFilter);

    /// Mark keys stale and refetch them. Resolves once the refetch has landed.
    async fn invalidate(&self, filter: &KeyFilter) -> Result<(), FetchError>;
}

#[derive(Debug, Default)]
struct Entry {
    value: Option<Value>,
    stale: bool,
    // bumped by cancel_pending; a fetch that started under an older generation is dropped
    generation: u64,
}

/// In-memory [`QueryStore`].
///
/// Without a [`Fetcher`], `invalidate` only marks entries stale.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    fetcher: Option<Arc<dyn Fetcher>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.lock().len())
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fetcher: Some(fetcher),
        }
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.stale)
    }

    /// The cached value, fetching it first if missing or stale.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Value, FetchError> {
        {
            let entries = self.entries.lock();
            if let Some(Entry {
                value: Some(value),
                stale: false,
                ..
            }) = entries.get(key)
            {
                return Ok(value.clone());
            }
        }
        if self.fetcher.is_none()
            && let Some(value) = self.get(key)
        {
            return Ok(value);
        }
        self.refetch(key).await?;
        self.get(key).ok_or_else(|| FetchError::NoFetcher(key.clone()))
    }

    async fn refetch(&self, key: &CacheKey) -> Result<(), FetchError> {
        let Some(fetcher) = &self.fetcher else {
            return Err(FetchError::NoFetcher(key.clone()));
        };
        let generation = self.entries.lock().entry(key.clone()).or_default().generation;

        tracing::debug!("refetching {}", key);
        let value = fetcher.fetch(key).await?;

        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        if entry.generation != generation {
            tracing::debug!("discarding cancelled fetch of {}", key);
            return Ok(());
        }
        entry.value = Some(value);
        entry.stale = false;
        Ok(())
    }
}

#[async_trait]
impl QueryStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        self.entries.lock().get(key).and_then(|e| e.value.clone())
    }

    fn set(&self, key: &CacheKey, value: Value) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.value = Some(value);
        entry.stale = false;
    }

    fn remove(&self, key: &CacheKey) -> Option<Value> {
        self.entries.lock().remove(key).and_then(|e| e.value)
    }

    fn keys(&self, filter: &KeyFilter) -> Vec<CacheKey> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, entry)| entry.value.is_some() && filter.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn cancel_pending(&self, filter: &KeyFilter) {
        for (key, entry) in self.entries.lock().iter_mut() {
            if filter.matches(key) {
                entry.generation += 1;
            }
        }
    }

    async fn invalidate(&self, filter: &KeyFilter) -> Result<(), FetchError> {
        let keys: Vec<CacheKey> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|(key, _)| filter.matches(key))
                .map(|(key, entry)| {
                    entry.stale = true;
                    key.clone()
                })
                .collect()
        };
        tracing::debug!("invalidated {} ({} keys)", filter, keys.len());
        if self.fetcher.is_none() {
            return Ok(());
        }

        let mut first_error = None;
        for key in &keys {
            if let Err(e) = self.refetch(key).await {
                tracing::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key::{FeedScope, KeyFamily};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use wayfarer_core::PostId;

    /// Serves whatever the test put in its table, optionally waiting for a gate.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        pub(crate) server: Mutex<HashMap<CacheKey, Value>>,
        pub(crate) calls: AtomicUsize,
        pub(crate) gate: Option<Notify>,
    }

    impl ScriptedFetcher {
        pub(crate) fn serving(entries: impl IntoIterator<Item = (CacheKey, Value)>) -> Self {
            Self {
                server: Mutex::new(entries.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, key: &CacheKey) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.server
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| FetchError::Failed {
                    key: key.clone(),
                    reason: "404".to_string(),
                })
        }
    }

    fn post(id: &str) -> CacheKey {
        CacheKey::Post(PostId::from(id))
    }

    #[tokio::test]
    async fn invalidate_refetches_matching_keys() {
        let fetcher = Arc::new(ScriptedFetcher::serving([
            (CacheKey::Feed(FeedScope::Home), json!(["fresh"])),
            (post("p1"), json!({"id": "p1"})),
        ]));
        let store = MemoryStore::with_fetcher(fetcher.clone());
        store.set(&CacheKey::Feed(FeedScope::Home), json!(["old"]));
        store.set(&post("p1"), json!({"id": "p1", "old": true}));

        store.invalidate(&KeyFamily::Feed.into()).await.unwrap();

        assert_eq!(store.get(&CacheKey::Feed(FeedScope::Home)), Some(json!(["fresh"])));
        assert_eq!(store.get(&post("p1")), Some(json!({"id": "p1", "old": true})));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_without_fetcher_marks_stale() {
        let store = MemoryStore::new();
        store.set(&post("p1"), json!(1));

        store.invalidate(&KeyFilter::Any).await.unwrap();

        assert!(store.is_stale(&post("p1")));
        assert_eq!(store.get(&post("p1")), Some(json!(1)));
    }

    #[tokio::test]
    async fn failed_refetch_keeps_value_stale() {
        let store = MemoryStore::with_fetcher(Arc::new(ScriptedFetcher::default()));
        store.set(&post("gone"), json!(1));

        let err = store.invalidate(&post("gone").into()).await.unwrap_err();

        assert!(matches!(err, FetchError::Failed { .. }));
        assert!(store.is_stale(&post("gone")));
        assert_eq!(store.get(&post("gone")), Some(json!(1)));
    }

    #[tokio::test]
    async fn fetch_loads_missing_and_reuses_fresh() {
        let fetcher = Arc::new(ScriptedFetcher::serving([(post("p1"), json!("server"))]));
        let store = MemoryStore::with_fetcher(fetcher.clone());

        assert_eq!(store.fetch(&post("p1")).await.unwrap(), json!("server"));
        assert_eq!(store.fetch(&post("p1")).await.unwrap(), json!("server"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_without_fetcher() {
        let store = MemoryStore::new();
        assert_eq!(
            store.fetch(&post("p1")).await,
            Err(FetchError::NoFetcher(post("p1")))
        );
        store.set(&post("p1"), json!(2));
        assert_eq!(store.fetch(&post("p1")).await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn cancelled_fetch_does_not_overwrite() {
        let fetcher = Arc::new(ScriptedFetcher {
            gate: Some(Notify::new()),
            ..ScriptedFetcher::serving([(post("p1"), json!("stale server value"))])
        });
        let store = Arc::new(MemoryStore::with_fetcher(fetcher.clone()));
        store.set(&post("p1"), json!("cached"));

        let refetch = tokio::spawn({
            let store = store.clone();
            async move { store.invalidate(&post("p1").into()).await }
        });
        while fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        store.cancel_pending(&post("p1").into());
        store.set(&post("p1"), json!("speculative"));
        if let Some(gate) = &fetcher.gate {
            gate.notify_one();
        }
        refetch.await.unwrap().unwrap();

        assert_eq!(store.get(&post("p1")), Some(json!("speculative")));
    }

    #[test]
    fn keys_respects_filter() {
        let store = MemoryStore::new();
        store.set(&post("p1"), json!(1));
        store.set(&CacheKey::SavedPosts, json!([]));

        assert_eq!(store.keys(&KeyFamily::Post.into()), vec![post("p1")]);
        assert_eq!(store.keys(&KeyFilter::Any).len(), 2);
        assert_eq!(store.remove(&post("p1")), Some(json!(1)));
        assert!(store.keys(&KeyFamily::Post.into()).is_empty());
    }
}
