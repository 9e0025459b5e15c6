//! Shallow-compare middleware.
//!
//! Suppresses writes that are shallowly equal to the last value seen for
//! a key, sparing the backend a redundant operation and subscribers a
//! redundant notification. The last-value cache is a bounded [`moka`]
//! cache, so an unbounded key space cannot grow it without limit.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use tracing::debug;

use crate::action::{Action, ActionKind, ActionOutcome};
use crate::diff::shallow_equal;
use crate::error::StoreResult;
use crate::pipeline::{Middleware, Next};

/// Decides whether two values are close enough to skip the write.
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// The deduplicating interceptor. Register once per store, inside any
/// batching middleware so merged flushes are compared too.
pub struct ShallowCompareMiddleware {
    cache: Cache<String, Value>,
    comparator: Comparator,
    /// When set, only these segments (`kind_key`) participate.
    segments: Option<HashSet<String>>,
}

impl ShallowCompareMiddleware {
    /// Start building with the default comparator and capacity.
    pub fn builder() -> ShallowCompareBuilder {
        ShallowCompareBuilder {
            capacity: 10_000,
            comparator: Arc::new(shallow_equal),
            segments: None,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    fn participates(&self, action: &Action) -> bool {
        match &self.segments {
            Some(filter) => filter.contains(&action.segment()),
            None => true,
        }
    }
}

impl Default for ShallowCompareMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`ShallowCompareMiddleware`].
pub struct ShallowCompareBuilder {
    capacity: u64,
    comparator: Comparator,
    segments: Option<HashSet<String>>,
}

impl ShallowCompareBuilder {
    /// Maximum number of keys the last-value cache holds.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replace the default shallow-equality comparator.
    pub fn comparator(
        mut self,
        comparator: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.comparator = Arc::new(comparator);
        self
    }

    /// Restrict participation to the given segments (`kind_key` strings,
    /// e.g. `"set_session"`). All other actions pass through untouched.
    pub fn segments(mut self, segments: impl IntoIterator<Item = String>) -> Self {
        self.segments = Some(segments.into_iter().collect());
        self
    }

    pub fn build(self) -> ShallowCompareMiddleware {
        ShallowCompareMiddleware {
            cache: Cache::builder().max_capacity(self.capacity).build(),
            comparator: self.comparator,
            segments: self.segments,
        }
    }
}

#[async_trait]
impl Middleware for ShallowCompareMiddleware {
    fn name(&self) -> &str {
        "shallow-compare"
    }

    async fn cleanup(&self) -> StoreResult<()> {
        self.cache.invalidate_all();
        Ok(())
    }

    async fn handle(&self, action: Action, next: Next<'_>) -> StoreResult<ActionOutcome> {
        if action.kind != ActionKind::Set || !self.participates(&action) {
            return next.run(action).await;
        }
        let key = action.key.clone().unwrap_or_default();
        let value = action.value.clone().unwrap_or(Value::Null);

        if let Some(previous) = self.cache.get(&key).await {
            if (self.comparator)(&previous, &value) {
                debug!(key, "set suppressed by shallow compare");
                // Short-circuit: the cache keeps the previous value.
                return Ok(ActionOutcome::Unchanged(Some(previous)));
            }
        }

        let outcome = next.run(action).await?;
        self.cache.insert(key, value).await;
        Ok(outcome)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use serde_json::json;

    async fn deduped_store() -> StateStore {
        let store = StateStore::builder("shallow-test")
            .middleware(Arc::new(ShallowCompareMiddleware::new()))
            .build();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn equal_set_notifies_exactly_once() {
        let store = deduped_store().await;

        let mut sub = store.subscribe("user").await.unwrap();
        sub.recv().await.unwrap(); // initial replay

        store.set("user", json!({"name": "ada"})).await.unwrap();
        store.set("user", json!({"name": "ada"})).await.unwrap();

        assert!(sub.recv().await.is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn unchanged_set_returns_previous_value() {
        let store = deduped_store().await;
        store.set("k", json!([1, 2])).await.unwrap();

        let before = store.version();
        let returned = store.set("k", json!([1, 2])).await.unwrap();
        assert_eq!(returned, Some(json!([1, 2])));
        // Suppressed writes do not advance the version.
        assert_eq!(store.version(), before);
    }

    #[tokio::test]
    async fn changed_value_passes_through() {
        let store = deduped_store().await;
        store.set("k", json!({"a": 1})).await.unwrap();
        store.set("k", json!({"a": 2})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn segment_filter_limits_participation() {
        let middleware = ShallowCompareMiddleware::builder()
            .segments(["set_watched".to_string()])
            .build();
        let store = StateStore::builder("filtered")
            .middleware(Arc::new(middleware))
            .build();
        store.initialize().await.unwrap();

        let mut watched = store.subscribe("watched").await.unwrap();
        let mut other = store.subscribe("other").await.unwrap();
        watched.recv().await.unwrap();
        other.recv().await.unwrap();

        store.set("watched", json!(1)).await.unwrap();
        store.set("watched", json!(1)).await.unwrap();
        store.set("other", json!(1)).await.unwrap();
        store.set("other", json!(1)).await.unwrap();

        // Watched: deduplicated. Other: both writes notified.
        watched.recv().await.unwrap();
        assert!(watched.try_recv().is_none());
        other.recv().await.unwrap();
        assert!(other.try_recv().is_some());
    }

    #[tokio::test]
    async fn custom_comparator_overrides_default() {
        // Comparator that treats any two numbers as equal.
        let middleware = ShallowCompareMiddleware::builder()
            .comparator(|a, b| a.is_number() && b.is_number())
            .build();
        let store = StateStore::builder("custom")
            .middleware(Arc::new(middleware))
            .build();
        store.initialize().await.unwrap();

        store.set("n", json!(1)).await.unwrap();
        let returned = store.set("n", json!(999)).await.unwrap();
        // Suppressed: previous value survives.
        assert_eq!(returned, Some(json!(1)));
        assert_eq!(store.get("n").await.unwrap(), Some(json!(1)));
    }
}
