//! # statekit
//!
//! A pluggable, reactive key-value state container.
//!
//! Many independent consumers observe fine-grained paths inside a shared,
//! versioned JSON state tree without polling, while a chain of
//! interceptors can transform, batch, deduplicate, or replicate every
//! mutation before it reaches the underlying backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SelectorRegistry (memoized derived values)  │
//! ├──────────────────────────────────────────────┤
//! │  StateStore                                  │
//! │   · subscriber registry + change diffing     │
//! │   · plugin hooks, lifecycle events, status   │
//! ├──────────────────────────────────────────────┤
//! │  Pipeline: batch → shallow-compare → sync    │
//! ├──────────────────────────────────────────────┤
//! │  Backend: MemoryBackend / statekit-sqlite    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use statekit::{BatchConfig, BatchMiddleware, StateStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let store = StateStore::builder("app")
//!     .middleware(Arc::new(BatchMiddleware::new(BatchConfig::default())))
//!     .build();
//! store.initialize().await?;
//!
//! let mut counter = store.subscribe("count").await?;
//! store.set("count", json!(1)).await?;
//! let change = counter.recv().await;
//! ```

pub mod action;
pub mod backend;
pub mod batch;
pub mod diff;
pub mod error;
pub mod events;
pub mod memory;
pub mod path;
pub mod pipeline;
pub mod plugin;
pub mod selector;
pub mod shallow;
pub mod store;
pub mod subscription;
pub mod sync;

// ── re-exports ───────────────────────────────────────────────────────

pub use action::{Action, ActionKind, ActionOutcome, UpdateEntry};
pub use backend::{Backend, BackendKind};
pub use batch::{BatchConfig, BatchMiddleware};
pub use error::{StoreError, StoreResult};
pub use events::{EventBus, StoreEvent};
pub use memory::MemoryBackend;
pub use path::{StatePath, GLOBAL_PATH};
pub use pipeline::{Middleware, MiddlewareApi, Next, Pipeline};
pub use plugin::StorePlugin;
pub use selector::{Selector, SelectorRegistry, SelectorSubscription};
pub use shallow::ShallowCompareMiddleware;
pub use store::{StateStore, StoreBuilder, StoreStatus};
pub use subscription::{StateChange, Subscription};
pub use sync::{SyncChannelHub, SyncMessage, SyncMessageKind, SyncMiddleware, SyncUpdate};
