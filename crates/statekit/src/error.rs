//! Error types for the statekit crate.
//!
//! All store operations return [`StoreError`] via [`StoreResult`].
//! Uses `thiserror` for ergonomic, zero-cost error definitions.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the state container.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A data operation was attempted before the store reached `Ready`.
    #[error("store `{name}` is not ready (status: {status})")]
    NotReady { name: String, status: String },

    /// A raw backend operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A before/after plugin hook aborted the surrounding operation.
    #[error("plugin hook `{hook}` failed: {message}")]
    Plugin { hook: &'static str, message: String },

    /// A middleware reducer aborted the dispatch chain.
    #[error("middleware `{name}` failed: {message}")]
    Middleware { name: String, message: String },

    /// A path string could not be addressed in the state tree.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The broadcast channel backing a sync participant was torn down.
    #[error("sync channel closed")]
    ChannelClosed,

    /// The store has been destroyed and accepts no further operations.
    #[error("store `{0}` has been destroyed")]
    Destroyed(String),

    /// A background task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// Collapse this error into a cloneable middleware failure.
    ///
    /// Batching resolves several callers with one operation result, so the
    /// original (non-`Clone`) error is flattened to its message once and
    /// re-wrapped per caller.
    pub(crate) fn for_batch(&self) -> String {
        self.to_string()
    }
}
