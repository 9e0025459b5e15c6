//! Write-batching middleware.
//!
//! Collapses bursts of same-segment writes (segment = action kind +
//! target key) into fewer backend operations while preserving every
//! caller's individual promise. Eligible actions are queued per segment;
//! a per-segment timer is re-armed on every push, and reaching the size
//! threshold flushes immediately. A flush merges queued actions by
//! last-write-wins per exact `(kind, key)` pair, executes only the merged
//! set, and resolves every original caller whose pair matches a merged
//! operation with that operation's outcome, so N collapsed callers all
//! observe the same result. One failing merged operation rejects only its
//! own callers.
//!
//! Flushes re-enter the pipeline with the `processed` flag already
//! stamped, so the re-entrancy guard routes them straight to the base
//! executor instead of re-wrapping the chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::action::{Action, ActionKind, ActionOutcome};
use crate::error::{StoreError, StoreResult};
use crate::pipeline::{Middleware, MiddlewareApi, Next};

/// Tuning knobs for [`BatchMiddleware`].
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// How long a segment may sit idle before its queue is flushed.
    pub delay: Duration,
    /// Queue length at which a segment flushes without waiting.
    pub max_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            max_batch: 16,
        }
    }
}

struct QueuedItem {
    action: Action,
    done: oneshot::Sender<Result<ActionOutcome, String>>,
    queued_at: Instant,
}

#[derive(Default)]
struct Segment {
    items: Vec<QueuedItem>,
    timer: Option<JoinHandle<()>>,
}

type SegmentMap = Arc<Mutex<HashMap<String, Segment>>>;

/// The batching interceptor. Register once per store.
pub struct BatchMiddleware {
    config: BatchConfig,
    segments: SegmentMap,
    api: Arc<OnceLock<MiddlewareApi>>,
}

impl BatchMiddleware {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            segments: Arc::new(Mutex::new(HashMap::new())),
            api: Arc::new(OnceLock::new()),
        }
    }

    /// Merge `items` last-write-wins per `(kind, key)` pair, preserving
    /// first-seen order, then execute each merged operation and resolve
    /// every matching caller with its outcome.
    async fn flush(segments: SegmentMap, api: Arc<OnceLock<MiddlewareApi>>, segment_key: String) {
        let segment = {
            let mut map = segments.lock().expect("batch segments poisoned");
            map.remove(&segment_key)
        };
        let Some(mut segment) = segment else { return };
        if let Some(timer) = segment.timer.take() {
            timer.abort();
        }
        if segment.items.is_empty() {
            return;
        }
        let Some(api) = api.get().cloned() else {
            // Setup never ran; nothing can execute these.
            for item in segment.items {
                let _ = item
                    .done
                    .send(Err("batch middleware was never set up".to_string()));
            }
            return;
        };

        let oldest = segment
            .items
            .iter()
            .map(|item| item.queued_at.elapsed())
            .max()
            .unwrap_or_default();
        debug!(
            segment = %segment_key,
            queued = segment.items.len(),
            oldest_ms = oldest.as_millis() as u64,
            "flushing batch segment"
        );

        // Last-write-wins merge, first-seen order preserved.
        let mut order: Vec<String> = Vec::new();
        let mut merged: HashMap<String, Action> = HashMap::new();
        for item in &segment.items {
            let pair = merge_key(&item.action);
            if !merged.contains_key(&pair) {
                order.push(pair.clone());
            }
            merged.insert(pair, item.action.clone());
        }

        let mut items = segment.items;
        for pair in order {
            let action = merged.remove(&pair).expect("pair recorded above");
            let result = match api.dispatch(action).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    warn!(segment = %segment_key, error = %err, "merged batch operation failed");
                    Err(err.for_batch())
                }
            };
            // Resolve every caller that collapsed into this operation;
            // a failure here must not reject the flush's other pairs.
            let mut rest = Vec::with_capacity(items.len());
            for item in std::mem::take(&mut items) {
                if merge_key(&item.action) == pair {
                    let _ = item.done.send(result.clone());
                } else {
                    rest.push(item);
                }
            }
            items = rest;
        }
    }

    fn arm_timer(&self, segment_key: &str) -> JoinHandle<()> {
        let segments = Arc::clone(&self.segments);
        let api = Arc::clone(&self.api);
        let key = segment_key.to_string();
        let delay = self.config.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::flush(segments, api, key).await;
        })
    }
}

fn merge_key(action: &Action) -> String {
    format!("{}_{}", action.kind.as_str(), action.key.as_deref().unwrap_or(""))
}

#[async_trait]
impl Middleware for BatchMiddleware {
    fn name(&self) -> &str {
        "batch"
    }

    async fn setup(&self, api: MiddlewareApi) -> StoreResult<()> {
        let _ = self.api.set(api);
        Ok(())
    }

    async fn cleanup(&self) -> StoreResult<()> {
        let drained: Vec<Segment> = {
            let mut map = self.segments.lock().expect("batch segments poisoned");
            map.drain().map(|(_, segment)| segment).collect()
        };
        for mut segment in drained {
            if let Some(timer) = segment.timer.take() {
                timer.abort();
            }
            for item in segment.items {
                let _ = item
                    .done
                    .send(Err("store destroyed with writes pending in batch".to_string()));
            }
        }
        Ok(())
    }

    async fn handle(&self, action: Action, next: Next<'_>) -> StoreResult<ActionOutcome> {
        if !matches!(action.kind, ActionKind::Set | ActionKind::Update) {
            return next.run(action).await;
        }

        let segment_key = action.segment();
        let (done, outcome_rx) = oneshot::channel();
        let flush_now = {
            let mut map = self.segments.lock().expect("batch segments poisoned");
            let segment = map.entry(segment_key.clone()).or_default();
            segment.items.push(QueuedItem {
                action,
                done,
                queued_at: Instant::now(),
            });
            trace!(segment = %segment_key, queued = segment.items.len(), "write queued");
            if segment.items.len() >= self.config.max_batch {
                if let Some(timer) = segment.timer.take() {
                    timer.abort();
                }
                true
            } else {
                if let Some(timer) = segment.timer.take() {
                    timer.abort();
                }
                segment.timer = Some(self.arm_timer(&segment_key));
                false
            }
        };

        if flush_now {
            Self::flush(
                Arc::clone(&self.segments),
                Arc::clone(&self.api),
                segment_key,
            )
            .await;
        }

        match outcome_rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(message)) => Err(StoreError::Middleware {
                name: "batch".into(),
                message,
            }),
            Err(_) => Err(StoreError::Middleware {
                name: "batch".into(),
                message: "batch flush dropped the caller".into(),
            }),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::UpdateEntry;
    use crate::backend::{Backend, BackendKind};
    use crate::memory::MemoryBackend;
    use crate::store::StateStore;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts raw writes so tests can observe merge behavior.
    struct CountingBackend {
        inner: MemoryBackend,
        sets: AtomicUsize,
        fail_key: Option<String>,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                sets: AtomicUsize::new(0),
                fail_key: None,
            }
        }

        fn failing_on(key: &str) -> Self {
            Self {
                fail_key: Some(key.to_string()),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl Backend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }

        async fn initialize(&self) -> StoreResult<()> {
            self.inner.initialize().await
        }

        async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
            self.inner.get(path).await
        }

        async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
            if self.fail_key.as_deref() == Some(path) {
                return Err(StoreError::Backend("medium unavailable".into()));
            }
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set(path, value).await
        }

        async fn update(&self, entries: Vec<UpdateEntry>) -> StoreResult<()> {
            self.inner.update(entries).await
        }

        async fn delete(&self, path: &str) -> StoreResult<bool> {
            self.inner.delete(path).await
        }

        async fn clear(&self) -> StoreResult<()> {
            self.inner.clear().await
        }

        async fn keys(&self) -> StoreResult<Vec<String>> {
            self.inner.keys().await
        }

        async fn has(&self, path: &str) -> StoreResult<bool> {
            self.inner.has(path).await
        }

        async fn destroy(&self) -> StoreResult<()> {
            self.inner.destroy().await
        }
    }

    async fn batched_store(backend: Arc<CountingBackend>, config: BatchConfig) -> StateStore {
        let store = StateStore::builder("batch-test")
            .backend(backend)
            .middleware(Arc::new(BatchMiddleware::new(config)))
            .build();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn rapid_sets_collapse_into_one_write() {
        let backend = Arc::new(CountingBackend::new());
        let store = batched_store(
            Arc::clone(&backend),
            BatchConfig {
                delay: Duration::from_millis(20),
                max_batch: 16,
            },
        )
        .await;

        let (r1, r2, r3) = tokio::join!(
            store.set("x", json!(1)),
            store.set("x", json!(2)),
            store.set("x", json!(3)),
        );

        // All three callers observe the single flushed write's value.
        assert_eq!(r1.unwrap(), Some(json!(3)));
        assert_eq!(r2.unwrap(), Some(json!(3)));
        assert_eq!(r3.unwrap(), Some(json!(3)));
        assert_eq!(backend.sets.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("x").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn different_keys_flush_independently() {
        let backend = Arc::new(CountingBackend::new());
        let store = batched_store(
            Arc::clone(&backend),
            BatchConfig {
                delay: Duration::from_millis(10),
                max_batch: 16,
            },
        )
        .await;

        let (a, b) = tokio::join!(store.set("a", json!(1)), store.set("b", json!(2)));
        a.unwrap();
        b.unwrap();

        assert_eq!(backend.sets.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn size_threshold_flushes_without_waiting() {
        let backend = Arc::new(CountingBackend::new());
        let store = batched_store(
            Arc::clone(&backend),
            BatchConfig {
                // A delay long enough that only the size trigger can flush.
                delay: Duration::from_secs(30),
                max_batch: 2,
            },
        )
        .await;

        let (r1, r2) = tokio::join!(store.set("x", json!("a")), store.set("x", json!("b")));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(backend.sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reads_pass_through_unbatched() {
        let backend = Arc::new(CountingBackend::new());
        let store = batched_store(Arc::clone(&backend), BatchConfig::default()).await;

        store.set("k", json!(1)).await.unwrap();
        // A get resolves immediately, no queue involved.
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(store.keys().await.unwrap(), ["k"]);
    }

    #[tokio::test]
    async fn failure_rejects_only_matching_callers() {
        let backend = Arc::new(CountingBackend::failing_on("bad"));
        let store = batched_store(
            Arc::clone(&backend),
            BatchConfig {
                delay: Duration::from_millis(10),
                max_batch: 16,
            },
        )
        .await;

        let (bad, good) = tokio::join!(store.set("bad", json!(1)), store.set("ok", json!(2)));

        assert!(matches!(
            bad.unwrap_err(),
            StoreError::Middleware { .. }
        ));
        assert_eq!(good.unwrap(), Some(json!(2)));
        assert_eq!(store.get("ok").await.unwrap(), Some(json!(2)));
    }
}
