//! The backend adapter contract.
//!
//! A backend implements the raw primitive operations over a concrete
//! medium; everything above it (diffing, notification, interception) is
//! backend-agnostic. The path `""` always denotes the whole tree.

use async_trait::async_trait;
use serde_json::Value;

use crate::action::UpdateEntry;
use crate::error::StoreResult;

/// How a backend's medium relates to sibling execution contexts.
///
/// The broadcast sync middleware uses this classification: process-local
/// media must have mutation payloads replicated to them, while host-shared
/// media already reflect a peer's write and only need a refresh-and-notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local storage; peers cannot see writes without replication.
    Memory,
    /// A medium the platform already shares between contexts (e.g. a
    /// database file on common disk).
    SharedMedium,
}

/// The five raw operations plus lifecycle that every backend provides.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Classification used by replication middleware.
    fn kind(&self) -> BackendKind;

    /// Prepare the medium (open files, create schema). Called once by the
    /// store during `initialize()`.
    async fn initialize(&self) -> StoreResult<()>;

    /// Read the value at `path`; `""` returns the whole tree.
    async fn get(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Write `value` at `path`; `""` replaces the whole tree.
    async fn set(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Apply a batch of top-level key changes in one operation.
    async fn update(&self, entries: Vec<UpdateEntry>) -> StoreResult<()>;

    /// Remove the value at `path`. Returns whether anything was removed.
    async fn delete(&self, path: &str) -> StoreResult<bool>;

    /// Remove every key.
    async fn clear(&self) -> StoreResult<()>;

    /// List the top-level keys.
    async fn keys(&self) -> StoreResult<Vec<String>>;

    /// Whether a value exists at `path`.
    async fn has(&self, path: &str) -> StoreResult<bool>;

    /// Release the medium. Called once by the store during `destroy()`.
    async fn destroy(&self) -> StoreResult<()>;
}
