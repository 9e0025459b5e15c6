//! Middleware dispatch pipeline.
//!
//! An ordered chain of interceptors wraps a base executor that performs
//! the raw backend operations. Each middleware receives the action and a
//! [`Next`] handle; it either forwards (possibly with a modified action)
//! or short-circuits by returning its own outcome, the classic
//! chain-of-responsibility shape.
//!
//! The chain is composed lazily: the first dispatch after any
//! registration folds the middleware list into a shared snapshot, which
//! is reused until the list changes again. A re-entrancy guard stamps
//! `meta.processed` the first time an action enters the chain; an action
//! re-dispatched with the flag set (e.g. a deferred batch flush) is
//! routed directly to the base executor instead of being re-wrapped.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::trace;

use crate::action::{Action, ActionKind, ActionOutcome, UpdateEntry};
use crate::backend::{Backend, BackendKind};
use crate::error::{StoreError, StoreResult};
use crate::path::StatePath;
use crate::store::StoreInner;

/// An interceptor in the dispatch chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Identifies the middleware in logs and errors.
    fn name(&self) -> &str;

    /// Called once when the middleware is registered with a store. The
    /// [`MiddlewareApi`] outlives the call and may be retained for deferred
    /// work (timers, channel listeners).
    async fn setup(&self, api: MiddlewareApi) -> StoreResult<()> {
        let _ = api;
        Ok(())
    }

    /// Called once during store teardown; releases timers, channels and
    /// any other resources the middleware holds.
    async fn cleanup(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Process `action`. Call `next.run(action)` to continue the chain or
    /// return an outcome to short-circuit it.
    async fn handle(&self, action: Action, next: Next<'_>) -> StoreResult<ActionOutcome>;
}

/// Handle to the remaining chain links plus the base executor.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    base: &'a BaseExecutor,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain with `action`.
    pub fn run(self, action: Action) -> BoxFuture<'a, StoreResult<ActionOutcome>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((middleware, rest)) => {
                    trace!(middleware = middleware.name(), kind = action.kind.as_str(), "chain step");
                    middleware
                        .handle(
                            action,
                            Next {
                                chain: rest,
                                base: self.base,
                            },
                        )
                        .await
                }
                None => self.base.execute(action).await,
            }
        })
    }
}

/// The innermost link: translates actions into raw backend operations.
pub struct BaseExecutor {
    backend: Arc<dyn Backend>,
}

impl BaseExecutor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn execute(&self, action: Action) -> StoreResult<ActionOutcome> {
        match action.kind {
            ActionKind::Get => {
                let key = action.key.unwrap_or_default();
                Ok(ActionOutcome::Value(self.backend.get(&key).await?))
            }
            ActionKind::Set => {
                let key = action.key.unwrap_or_default();
                let value = action.value.unwrap_or(Value::Null);
                self.backend.set(&key, value.clone()).await?;
                Ok(ActionOutcome::Value(Some(value)))
            }
            ActionKind::Update => {
                self.backend.update(action.entries).await?;
                Ok(ActionOutcome::Done)
            }
            ActionKind::Delete => {
                let key = action.key.unwrap_or_default();
                Ok(ActionOutcome::Deleted(self.backend.delete(&key).await?))
            }
            ActionKind::Clear => {
                self.backend.clear().await?;
                Ok(ActionOutcome::Done)
            }
            ActionKind::Keys => Ok(ActionOutcome::Keys(self.backend.keys().await?)),
            ActionKind::Init => {
                self.backend.initialize().await?;
                Ok(ActionOutcome::Done)
            }
        }
    }
}

/// The middleware chain plus its base executor.
pub struct Pipeline {
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    /// Built lazily on first dispatch, invalidated on registration.
    chain: Mutex<Option<Arc<[Arc<dyn Middleware>]>>>,
    base: BaseExecutor,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            middlewares: Mutex::new(Vec::new()),
            chain: Mutex::new(None),
            base: BaseExecutor::new(backend),
        }
    }

    /// Append a middleware to the chain. Takes effect on the next dispatch.
    pub fn register(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .lock()
            .expect("pipeline lock poisoned")
            .push(middleware);
        *self.chain.lock().expect("pipeline lock poisoned") = None;
    }

    /// Snapshot of the registered middlewares, outermost first.
    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares
            .lock()
            .expect("pipeline lock poisoned")
            .clone()
    }

    /// Dispatch `action` through the chain.
    pub async fn dispatch(&self, mut action: Action) -> StoreResult<ActionOutcome> {
        if action.meta.processed {
            // Re-entered by an inner middleware: go straight to the backend.
            trace!(kind = action.kind.as_str(), "re-dispatch routed to base executor");
            return self.base.execute(action).await;
        }
        action.meta.processed = true;
        let chain = self.snapshot();
        Next {
            chain: &chain,
            base: &self.base,
        }
        .run(action)
        .await
    }

    fn snapshot(&self) -> Arc<[Arc<dyn Middleware>]> {
        let mut chain = self.chain.lock().expect("pipeline lock poisoned");
        chain
            .get_or_insert_with(|| {
                let middlewares = self.middlewares.lock().expect("pipeline lock poisoned");
                trace!(links = middlewares.len(), "middleware chain built");
                Arc::from(middlewares.clone().into_boxed_slice())
            })
            .clone()
    }
}

/// Capabilities handed to a middleware at setup time.
///
/// Holds a weak reference to the owning store, so a retained api does not
/// keep a destroyed store alive. Raw operations bypass the action layer;
/// replication middleware uses them to apply externally-sourced updates
/// without re-entering the chain.
#[derive(Clone)]
pub struct MiddlewareApi {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) store_name: String,
}

impl MiddlewareApi {
    fn upgrade(&self) -> StoreResult<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or_else(|| StoreError::Destroyed(self.store_name.clone()))
    }

    /// The logical name of the owning store.
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Re-enter the dispatch pipeline. An action already stamped
    /// `processed` is routed directly to the base executor.
    pub async fn dispatch(&self, action: Action) -> StoreResult<ActionOutcome> {
        self.upgrade()?.pipeline.dispatch(action).await
    }

    /// The full current state tree.
    pub async fn state(&self) -> StoreResult<Value> {
        let store = self.upgrade()?;
        Ok(store
            .backend
            .get("")
            .await?
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())))
    }

    /// Classification of the owning store's backend.
    pub fn backend_kind(&self) -> StoreResult<BackendKind> {
        Ok(self.upgrade()?.backend.kind())
    }

    pub async fn raw_get(&self, path: &str) -> StoreResult<Option<Value>> {
        self.upgrade()?.backend.get(path).await
    }

    pub async fn raw_set(&self, path: &str, value: Value) -> StoreResult<()> {
        self.upgrade()?.backend.set(path, value).await
    }

    pub async fn raw_update(&self, entries: Vec<UpdateEntry>) -> StoreResult<()> {
        self.upgrade()?.backend.update(entries).await
    }

    pub async fn raw_delete(&self, path: &str) -> StoreResult<bool> {
        self.upgrade()?.backend.delete(path).await
    }

    pub async fn raw_clear(&self) -> StoreResult<()> {
        self.upgrade()?.backend.clear().await
    }

    pub async fn raw_keys(&self) -> StoreResult<Vec<String>> {
        self.upgrade()?.backend.keys().await
    }

    /// The subscriber-notification primitive: report externally-applied
    /// changes. Reads the current tree, notifies related and global
    /// subscribers, bumps the store version and emits a sync event.
    pub async fn notify(&self, changed: Vec<StatePath>) -> StoreResult<()> {
        self.upgrade()?.notify_external(changed).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
