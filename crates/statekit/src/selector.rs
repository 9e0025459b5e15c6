//! Derived-value (selector) memoization.
//!
//! Selectors project the state tree into derived values and re-notify
//! their subscribers only when the projected value actually changes.
//! They are layered purely on the store's subscription API; a selector
//! never touches the backend.
//!
//! Two shapes exist:
//!
//! - **Simple**: wraps `Fn(&Value) -> Value`. Evaluation is memoized
//!   against the store version, so repeated evaluation of an unchanged
//!   store returns the cached value without re-running the projection.
//! - **Combined**: wraps N dependency selectors plus a combiner.
//!   Dependencies resolve in parallel; dependency notifications are
//!   debounced (default 10 ms) so a burst of simultaneous changes causes
//!   one recomputation, not N.
//!
//! Selectors live in an explicit, reference-counted [`SelectorRegistry`]:
//! defining the same id twice returns the same instance, and `destroy()`
//! only tears the watcher down when the last handle is released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::store::StateStore;

/// Projects the full state tree into a derived value.
pub type ProjectFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// Folds dependency values into a combined result.
pub type CombineFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
/// Decides whether a freshly computed value equals the last emitted one.
pub type EqualsFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

fn structural_equals() -> EqualsFn {
    Arc::new(|a: &Value, b: &Value| a == b)
}

enum SelectorKind {
    Simple(ProjectFn),
    Combined {
        deps: Vec<Arc<SelectorInner>>,
        combine: CombineFn,
    },
}

struct Listener {
    id: Uuid,
    tx: mpsc::UnboundedSender<Value>,
}

struct SelectorInner {
    id: String,
    kind: SelectorKind,
    equals: EqualsFn,
    store: StateStore,
    debounce: Duration,
    /// (store version, value) of the most recent evaluation.
    memo: Mutex<Option<(u64, Value)>>,
    last_emitted: Mutex<Option<Value>>,
    listeners: Mutex<Vec<Listener>>,
    watcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    refs: AtomicUsize,
}

impl SelectorInner {
    /// Evaluate, reusing the memoized value while the store version is
    /// unchanged. Boxed because combined selectors recurse.
    fn evaluate(self: &Arc<Self>) -> BoxFuture<'static, StoreResult<Value>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let version = this.store.version();
            if let Some((memo_version, value)) = this
                .memo
                .lock()
                .expect("selector memo poisoned")
                .clone()
            {
                if memo_version == version {
                    trace!(selector = %this.id, version, "memoized evaluation");
                    return Ok(value);
                }
            }
            let value = match &this.kind {
                SelectorKind::Simple(project) => {
                    let state = this.store.state().await?;
                    project(&state)
                }
                SelectorKind::Combined { deps, combine } => {
                    let values =
                        try_join_all(deps.iter().map(|dep| dep.evaluate())).await?;
                    combine(&values)
                }
            };
            *this.memo.lock().expect("selector memo poisoned") = Some((version, value.clone()));
            Ok(value)
        })
    }

    /// Start the change watcher if it is not already running.
    fn ensure_watcher(self: &Arc<Self>) -> BoxFuture<'static, StoreResult<()>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let mut guard = this.watcher.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let task = match &this.kind {
                SelectorKind::Simple(_) => {
                    let mut sub = this.store.subscribe_all().await?;
                    let weak = Arc::downgrade(&this);
                    tokio::spawn(async move {
                        // The first delivery is the subscription replay,
                        // not a change.
                        let _ = sub.recv().await;
                        while sub.recv().await.is_some() {
                            let Some(selector) = weak.upgrade() else { break };
                            selector.reevaluate_and_emit().await;
                        }
                    })
                }
                SelectorKind::Combined { deps, .. } => {
                    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<()>();
                    let mut forwards = Vec::with_capacity(deps.len());
                    for dep in deps {
                        let mut dep_sub = Arc::clone(dep).subscribe_impl().await?;
                        let tx = signal_tx.clone();
                        forwards.push(tokio::spawn(async move {
                            while dep_sub.recv().await.is_some() {
                                if tx.send(()).is_err() {
                                    break;
                                }
                            }
                        }));
                    }
                    drop(signal_tx);
                    let weak = Arc::downgrade(&this);
                    let debounce = this.debounce;
                    tokio::spawn(async move {
                        while signal_rx.recv().await.is_some() {
                            // Collapse a burst of dependency signals into
                            // one recomputation.
                            tokio::time::sleep(debounce).await;
                            while signal_rx.try_recv().is_ok() {}
                            let Some(selector) = weak.upgrade() else { break };
                            selector.reevaluate_and_emit().await;
                        }
                        for task in forwards {
                            task.abort();
                        }
                    })
                }
            };
            *guard = Some(task);
            Ok(())
        })
    }

    async fn reevaluate_and_emit(self: &Arc<Self>) {
        match self.evaluate().await {
            Ok(value) => {
                let should_emit = {
                    let mut last = self.last_emitted.lock().expect("selector state poisoned");
                    match &*last {
                        Some(previous) if (self.equals)(previous, &value) => false,
                        _ => {
                            *last = Some(value.clone());
                            true
                        }
                    }
                };
                if should_emit {
                    trace!(selector = %self.id, "selector value changed");
                    self.listeners
                        .lock()
                        .expect("selector state poisoned")
                        .retain(|listener| listener.tx.send(value.clone()).is_ok());
                }
            }
            Err(err) => warn!(selector = %self.id, error = %err, "selector re-evaluation failed"),
        }
    }

    fn subscribe_impl(self: Arc<Self>) -> BoxFuture<'static, StoreResult<SelectorSubscription>> {
        Box::pin(async move {
            self.ensure_watcher().await?;
            let current = self.evaluate().await?;
            {
                let mut last = self.last_emitted.lock().expect("selector state poisoned");
                if last.is_none() {
                    *last = Some(current.clone());
                }
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let id = Uuid::now_v7();
            // Immediate delivery of the current value.
            let _ = tx.send(current);
            self.listeners
                .lock()
                .expect("selector state poisoned")
                .push(Listener { id, tx });
            Ok(SelectorSubscription {
                id,
                rx,
                selector: Arc::downgrade(&self),
            })
        })
    }
}

/// Handle to a registered selector.
pub struct Selector {
    inner: Arc<SelectorInner>,
    registry: Weak<DashMap<String, Arc<SelectorInner>>>,
}

impl Selector {
    /// The selector's stable identity.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// One fresh-or-cached evaluation, without a standing subscription.
    pub async fn select(&self) -> StoreResult<Value> {
        self.inner.evaluate().await
    }

    /// Subscribe to value changes. The current value is delivered
    /// immediately; afterwards only actual changes arrive.
    pub async fn subscribe(&self) -> StoreResult<SelectorSubscription> {
        Arc::clone(&self.inner).subscribe_impl().await
    }

    /// Release this handle. The watcher and registry entry are torn down
    /// only when the last reference for this id is released; a combined
    /// selector then releases the references it holds on its dependencies.
    pub async fn destroy(self) {
        release(Arc::clone(&self.inner), self.registry.clone()).await;
    }
}

fn release(
    inner: Arc<SelectorInner>,
    registry: Weak<DashMap<String, Arc<SelectorInner>>>,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if inner.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(entries) = registry.upgrade() {
            entries.remove(&inner.id);
        }
        if let Some(task) = inner.watcher.lock().await.take() {
            task.abort();
        }
        inner
            .listeners
            .lock()
            .expect("selector state poisoned")
            .clear();
        if let SelectorKind::Combined { deps, .. } = &inner.kind {
            for dep in deps {
                release(Arc::clone(dep), registry.clone()).await;
            }
        }
        debug!(selector = %inner.id, "selector torn down");
    })
}

/// A live selector subscription; unregisters its listener on drop.
pub struct SelectorSubscription {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<Value>,
    selector: Weak<SelectorInner>,
}

impl SelectorSubscription {
    /// Await the next value. Returns `None` once the selector is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Poll for an already-delivered value without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for SelectorSubscription {
    fn drop(&mut self) {
        if let Some(selector) = self.selector.upgrade() {
            selector
                .listeners
                .lock()
                .expect("selector state poisoned")
                .retain(|listener| listener.id != self.id);
        }
    }
}

/// Reference-counted registry of a store's selectors.
///
/// Handed through context rather than living in ambient global state, so
/// teardown and tests stay deterministic.
#[derive(Clone)]
pub struct SelectorRegistry {
    store: StateStore,
    entries: Arc<DashMap<String, Arc<SelectorInner>>>,
    debounce: Duration,
}

impl SelectorRegistry {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            entries: Arc::new(DashMap::new()),
            debounce: Duration::from_millis(10),
        }
    }

    /// Override the combined-selector debounce window (default 10 ms).
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Number of distinct selectors currently registered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Define (or re-reference) a simple selector under `id`.
    pub fn define(
        &self,
        id: impl Into<String>,
        project: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Selector {
        self.define_with(id, project, structural_equals())
    }

    /// Like [`define`](Self::define) with a custom change comparator.
    pub fn define_with(
        &self,
        id: impl Into<String>,
        project: impl Fn(&Value) -> Value + Send + Sync + 'static,
        equals: EqualsFn,
    ) -> Selector {
        let id = id.into();
        self.intern(id.clone(), || SelectorInner {
            id,
            kind: SelectorKind::Simple(Arc::new(project)),
            equals,
            store: self.store.clone(),
            debounce: self.debounce,
            memo: Mutex::new(None),
            last_emitted: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            watcher: tokio::sync::Mutex::new(None),
            refs: AtomicUsize::new(0),
        })
    }

    /// Define a simple selector with a unique generated id. Anonymous
    /// selectors are never deduplicated.
    pub fn define_anonymous(
        &self,
        project: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Selector {
        self.define(format!("anonymous-{}", Uuid::now_v7()), project)
    }

    /// Define (or re-reference) a combined selector over `deps`.
    pub fn combine(
        &self,
        id: impl Into<String>,
        deps: &[&Selector],
        combine: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Selector {
        self.combine_with(id, deps, combine, structural_equals())
    }

    /// Like [`combine`](Self::combine) with a custom change comparator.
    pub fn combine_with(
        &self,
        id: impl Into<String>,
        deps: &[&Selector],
        combine: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
        equals: EqualsFn,
    ) -> Selector {
        let id = id.into();
        let deps: Vec<Arc<SelectorInner>> =
            deps.iter().map(|dep| Arc::clone(&dep.inner)).collect();
        self.intern(id.clone(), || {
            // A freshly created combined selector holds one reference on
            // each dependency, released again when it is torn down.
            for dep in &deps {
                dep.refs.fetch_add(1, Ordering::AcqRel);
            }
            SelectorInner {
                id,
                kind: SelectorKind::Combined {
                    deps,
                    combine: Arc::new(combine),
                },
                equals,
                store: self.store.clone(),
                debounce: self.debounce,
                memo: Mutex::new(None),
                last_emitted: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                watcher: tokio::sync::Mutex::new(None),
                refs: AtomicUsize::new(0),
            }
        })
    }

    fn intern(&self, id: String, make: impl FnOnce() -> SelectorInner) -> Selector {
        let inner = self
            .entries
            .entry(id)
            .or_insert_with(|| Arc::new(make()))
            .clone();
        inner.refs.fetch_add(1, Ordering::AcqRel);
        Selector {
            inner,
            registry: Arc::downgrade(&self.entries),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
