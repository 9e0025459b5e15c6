//! The core storage engine.
//!
//! A [`StateStore`] owns one JSON state tree behind a pluggable backend,
//! a middleware dispatch pipeline, the subscriber registries, plugin
//! hooks and the lifecycle event bus. Every public data operation is
//! reified as an [`Action`](crate::action::Action) and dispatched through
//! the pipeline; after the innermost executor commits it, the store
//! computes the changed paths, notifies path-level and global
//! subscribers, and emits a lifecycle event.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --> Loading --> Ready
//!              \-----> Error   (a fresh initialize() may retry)
//! ```
//!
//! All data operations fail fast with [`StoreError::NotReady`] before
//! `Ready`. Destruction is terminal and releases every subscriber,
//! middleware resource and the backend medium.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::action::{Action, ActionOutcome, UpdateEntry};
use crate::backend::Backend;
use crate::diff::{changed_paths, top_level_keys};
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::memory::MemoryBackend;
use crate::path::{self, StatePath};
use crate::pipeline::{Middleware, MiddlewareApi, Pipeline};
use crate::plugin::StorePlugin;
use crate::subscription::{StateChange, SubscriberRegistry, Subscription};

/// Observable lifecycle state of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    Idle,
    Loading,
    Ready,
    Error(String),
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) pipeline: Pipeline,
    subscribers: Arc<SubscriberRegistry>,
    plugins: Vec<Arc<dyn StorePlugin>>,
    status: watch::Sender<StoreStatus>,
    init_lock: Mutex<()>,
    setup_done: AtomicBool,
    version: AtomicU64,
    events: EventBus,
    destroyed: AtomicBool,
}

/// A named, versioned, reactive key-value state container.
///
/// Cheaply cloneable; all clones share the same underlying store.
///
/// # Example
///
/// ```ignore
/// use statekit::StateStore;
/// use serde_json::json;
///
/// let store = StateStore::builder("app").build();
/// store.initialize().await?;
/// store.set("count", json!(0)).await?;
/// let mut sub = store.subscribe("count").await?;
/// ```
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Start building a store with the given logical name.
    pub fn builder(name: impl Into<String>) -> StoreBuilder {
        StoreBuilder {
            name: name.into(),
            backend: None,
            middlewares: Vec::new(),
            plugins: Vec::new(),
            event_capacity: 256,
        }
    }

    /// The store's logical name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle status.
    pub fn status(&self) -> StoreStatus {
        self.inner.status.borrow().clone()
    }

    /// Monotonic mutation counter; bumps on every applied change,
    /// including sync-applied ones. Selectors memoize against it.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Subscribe to lifecycle events. Events published before this call
    /// are not replayed.
    pub fn events(&self) -> broadcast::Receiver<Arc<StoreEvent>> {
        self.inner.events.subscribe()
    }

    /// Bring the store to `Ready`: initialize the backend through the
    /// pipeline, then run every middleware's `setup` once.
    ///
    /// Idempotent; concurrent callers during `Loading` all await the same
    /// completion. After a failure the status is `Error` and a fresh call
    /// may retry.
    #[instrument(skip(self), fields(store = %self.inner.name))]
    pub async fn initialize(&self) -> StoreResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(StoreError::Destroyed(inner.name.clone()));
        }
        let mut status_rx = inner.status.subscribe();
        // Whether this caller is awaiting an attempt started by another
        // caller; if that attempt fails, this call rejects with its error
        // instead of starting a fresh one.
        let mut awaiting_peer = false;
        loop {
            let current = status_rx.borrow_and_update().clone();
            match current {
                StoreStatus::Ready => return Ok(()),
                StoreStatus::Error(message) if awaiting_peer => {
                    return Err(StoreError::Backend(message));
                }
                StoreStatus::Loading => {
                    awaiting_peer = true;
                }
                StoreStatus::Idle | StoreStatus::Error(_) => {
                    if let Ok(_guard) = inner.init_lock.try_lock() {
                        if *inner.status.borrow() == StoreStatus::Ready {
                            return Ok(());
                        }
                        inner.status.send_replace(StoreStatus::Loading);
                        match self.run_initialization().await {
                            Ok(()) => {
                                inner.status.send_replace(StoreStatus::Ready);
                                inner.events.publish(StoreEvent::Initialized {
                                    name: inner.name.clone(),
                                });
                                info!("store ready");
                                return Ok(());
                            }
                            Err(err) => {
                                inner
                                    .status
                                    .send_replace(StoreStatus::Error(err.to_string()));
                                warn!(error = %err, "store initialization failed");
                                return Err(err);
                            }
                        }
                    }
                    // Another caller holds the init lock; fall through and
                    // wait for the status to move.
                    awaiting_peer = true;
                }
            }
            if status_rx.changed().await.is_err() {
                return Err(StoreError::Destroyed(inner.name.clone()));
            }
        }
    }

    async fn run_initialization(&self) -> StoreResult<()> {
        self.inner.pipeline.dispatch(Action::init()).await?;
        // Single initializer (init_lock is held); only mark setup done
        // once every middleware actually came up, so a retry redoes it.
        if !self.inner.setup_done.load(Ordering::Acquire) {
            for middleware in self.inner.pipeline.middlewares() {
                debug!(middleware = middleware.name(), "middleware setup");
                middleware.setup(self.inner.api()).await?;
            }
            self.inner.setup_done.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Register an additional middleware on a live store and run its
    /// `setup` immediately.
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) -> StoreResult<()> {
        self.inner.pipeline.register(Arc::clone(&middleware));
        if self.inner.setup_done.load(Ordering::Acquire) {
            middleware.setup(self.inner.api()).await?;
        }
        Ok(())
    }

    /// Read the value at `key` (`""` for the whole tree).
    #[instrument(skip(self), fields(store = %self.inner.name))]
    pub async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.ensure_ready()?;
        let outcome = self.inner.pipeline.dispatch(Action::get(key)).await?;
        Ok(outcome.into_value())
    }

    /// The full current state tree.
    pub async fn state(&self) -> StoreResult<Value> {
        Ok(self
            .get("")
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Write `value` at `key`. Returns the stored value (the previous one
    /// when a middleware suppressed the write as redundant).
    #[instrument(skip(self, value), fields(store = %self.inner.name))]
    pub async fn set(&self, key: &str, value: Value) -> StoreResult<Option<Value>> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        for plugin in &inner.plugins {
            plugin
                .before_set(key, &value)
                .await
                .map_err(|err| StoreError::Plugin {
                    hook: "before_set",
                    message: format!("{}: {err}", plugin.name()),
                })?;
        }
        let outcome = inner.pipeline.dispatch(Action::set(key, value)).await?;
        if outcome.is_unchanged() {
            debug!(key, "set suppressed as unchanged");
            return Ok(outcome.into_value());
        }
        let stored = outcome.into_value();
        let tree = inner.tree().await?;
        let changed = inner.key_path(&tree, key);
        let keys = top_level_keys(std::slice::from_ref(&changed));
        inner.bump_version();
        inner.subscribers.notify(&keys, &[changed.clone()], &tree);
        inner.events.publish(StoreEvent::Updated {
            keys,
            changed_paths: vec![changed.to_string()],
        });
        Ok(stored)
    }

    /// Apply `mutator` to a deep clone of the tree, then commit and report
    /// only the paths that actually changed. A mutation that changes
    /// nothing dispatches nothing and notifies nobody.
    ///
    /// Returns the merged tree.
    #[instrument(skip(self, mutator), fields(store = %self.inner.name))]
    pub async fn update<F>(&self, mutator: F) -> StoreResult<Value>
    where
        F: FnOnce(&mut Value) + Send,
    {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let old = inner.tree().await?;
        let mut new = old.clone();
        mutator(&mut new);
        if !new.is_object() {
            return Err(StoreError::InvalidPath(
                "state root must remain an object".into(),
            ));
        }
        let changed = changed_paths(&old, &new);
        if changed.is_empty() {
            debug!("update changed nothing");
            return Ok(new);
        }
        let keys = top_level_keys(&changed);
        let entries = keys
            .iter()
            .map(|key| UpdateEntry {
                key: key.clone(),
                value: new.get(key).cloned(),
            })
            .collect();
        let outcome = inner.pipeline.dispatch(Action::update(entries)).await?;
        if outcome.is_unchanged() {
            return Ok(new);
        }
        inner.bump_version();
        inner.subscribers.notify(&keys, &changed, &new);
        inner.events.publish(StoreEvent::Updated {
            keys,
            changed_paths: changed.iter().map(|p| p.to_string()).collect(),
        });
        Ok(new)
    }

    /// Delete `key`. Plugins may deny the deletion, in which case this
    /// resolves `false` without touching the backend.
    #[instrument(skip(self), fields(store = %self.inner.name))]
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        for plugin in &inner.plugins {
            let permitted = plugin
                .before_delete(key)
                .await
                .map_err(|err| StoreError::Plugin {
                    hook: "before_delete",
                    message: format!("{}: {err}", plugin.name()),
                })?;
            if !permitted {
                debug!(key, plugin = plugin.name(), "delete denied by plugin");
                return Ok(false);
            }
        }
        let outcome = inner.pipeline.dispatch(Action::delete(key)).await?;
        let existed = matches!(outcome, ActionOutcome::Deleted(true));
        for plugin in &inner.plugins {
            plugin
                .after_delete(key)
                .await
                .map_err(|err| StoreError::Plugin {
                    hook: "after_delete",
                    message: format!("{}: {err}", plugin.name()),
                })?;
        }
        let tree = inner.tree().await?;
        let changed = inner.key_path(&tree, key);
        let keys = top_level_keys(std::slice::from_ref(&changed));
        inner.bump_version();
        inner.subscribers.notify(&keys, &[changed], &tree);
        inner.events.publish(StoreEvent::Deleted {
            key: key.to_string(),
        });
        Ok(existed)
    }

    /// Remove every key. Reported only as a lifecycle event plus a global
    /// notification of the empty state; no per-key notifications are
    /// synthesized.
    #[instrument(skip(self), fields(store = %self.inner.name))]
    pub async fn clear(&self) -> StoreResult<()> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        for plugin in &inner.plugins {
            plugin.on_clear().await.map_err(|err| StoreError::Plugin {
                hook: "on_clear",
                message: format!("{}: {err}", plugin.name()),
            })?;
        }
        inner.pipeline.dispatch(Action::clear()).await?;
        inner.bump_version();
        inner
            .subscribers
            .notify(&[], &[], &Value::Object(Map::new()));
        inner.events.publish(StoreEvent::Cleared);
        Ok(())
    }

    /// List the top-level keys.
    pub async fn keys(&self) -> StoreResult<Vec<String>> {
        self.inner.ensure_ready()?;
        match self.inner.pipeline.dispatch(Action::keys()).await? {
            ActionOutcome::Keys(keys) => Ok(keys),
            other => Err(StoreError::Middleware {
                name: "pipeline".into(),
                message: format!("keys action produced unexpected outcome: {other:?}"),
            }),
        }
    }

    /// Whether a value exists at `key`. Queries the backend directly, as
    /// the action vocabulary has no `has` kind.
    pub async fn has(&self, key: &str) -> StoreResult<bool> {
        self.inner.ensure_ready()?;
        self.inner.backend.has(key).await
    }

    /// Subscribe to changes on `path`. The first delivery replays the
    /// current value; later deliveries occur only on actual change to a
    /// path on the same branch.
    pub async fn subscribe(&self, path: impl Into<StatePath>) -> StoreResult<Subscription> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let path = path.into();
        let tree = inner.tree().await?;
        let subscription = inner.subscribers.add(path.clone());
        subscription.push(StateChange {
            keys: top_level_keys(std::slice::from_ref(&path)),
            value: path::value_at(&tree, &path).cloned(),
            changed_paths: vec![path.to_string()],
        });
        Ok(subscription)
    }

    /// Subscribe to every structural change. The first delivery replays
    /// the full current state.
    pub async fn subscribe_all(&self) -> StoreResult<Subscription> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let tree = inner.tree().await?;
        let keys = match &tree {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        let subscription = inner.subscribers.add_global();
        subscription.push(StateChange {
            keys,
            value: Some(tree),
            changed_paths: Vec::new(),
        });
        Ok(subscription)
    }

    /// Tear the store down: release the backend, run every middleware's
    /// `cleanup`, drop all subscribers and emit a final `Destroyed` event.
    ///
    /// Safe to call even if `initialize()` never completed; a second call
    /// is a no-op.
    #[instrument(skip(self), fields(store = %self.inner.name))]
    pub async fn destroy(&self) -> StoreResult<()> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.status.send_replace(StoreStatus::Idle);
        if let Err(err) = inner.backend.destroy().await {
            warn!(error = %err, "backend destroy failed");
        }
        for middleware in inner.pipeline.middlewares() {
            if let Err(err) = middleware.cleanup().await {
                warn!(middleware = middleware.name(), error = %err, "middleware cleanup failed");
            }
        }
        inner.subscribers.clear();
        inner.events.publish(StoreEvent::Destroyed {
            name: inner.name.clone(),
        });
        info!("store destroyed");
        Ok(())
    }
}

impl StoreInner {
    pub(crate) fn api(self: &Arc<Self>) -> MiddlewareApi {
        MiddlewareApi {
            store: Arc::downgrade(self),
            store_name: self.name.clone(),
        }
    }

    fn ensure_ready(&self) -> StoreResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(StoreError::Destroyed(self.name.clone()));
        }
        let status = self.status.borrow().clone();
        if status == StoreStatus::Ready {
            Ok(())
        } else {
            Err(StoreError::NotReady {
                name: self.name.clone(),
                status: status.to_string(),
            })
        }
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    async fn tree(&self) -> StoreResult<Value> {
        Ok(self
            .backend
            .get("")
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Resolve an operation key against the live tree: a verbatim
    /// top-level hit is a raw key, anything else is parsed.
    fn key_path(&self, tree: &Value, key: &str) -> StatePath {
        match tree {
            Value::Object(map) if map.contains_key(key) => StatePath::raw(key),
            _ => StatePath::parse(key),
        }
    }

    /// Notification primitive for externally-applied changes (broadcast
    /// sync): re-reads the tree, notifies related and global subscribers,
    /// bumps the version and emits a sync event.
    pub(crate) async fn notify_external(&self, changed: Vec<StatePath>) -> StoreResult<()> {
        let tree = self.tree().await?;
        let keys = top_level_keys(&changed);
        self.bump_version();
        self.subscribers.notify(&keys, &changed, &tree);
        self.events.publish(StoreEvent::SyncApplied { keys });
        Ok(())
    }
}

/// Builder for [`StateStore`].
pub struct StoreBuilder {
    name: String,
    backend: Option<Arc<dyn Backend>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    plugins: Vec<Arc<dyn StorePlugin>>,
    event_capacity: usize,
}

impl StoreBuilder {
    /// Use the given backend. Defaults to [`MemoryBackend`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Append a middleware to the dispatch chain (outermost first).
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Register an operation-hook plugin.
    pub fn plugin(mut self, plugin: Arc<dyn StorePlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Capacity of the lifecycle event channel.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the store. Middleware `setup` runs during `initialize()`,
    /// once the backend medium is available.
    pub fn build(self) -> StateStore {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let pipeline = Pipeline::new(Arc::clone(&backend));
        for middleware in &self.middlewares {
            pipeline.register(Arc::clone(middleware));
        }
        let (status, _) = watch::channel(StoreStatus::Idle);
        StateStore {
            inner: Arc::new(StoreInner {
                name: self.name,
                backend,
                pipeline,
                subscribers: Arc::new(SubscriberRegistry::new()),
                plugins: self.plugins,
                status,
                init_lock: Mutex::new(()),
                setup_done: AtomicBool::new(false),
                version: AtomicU64::new(0),
                events: EventBus::new(self.event_capacity),
                destroyed: AtomicBool::new(false),
            }),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
