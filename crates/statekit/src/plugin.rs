//! Before/after operation hooks.
//!
//! Plugins observe or veto individual store operations without entering
//! the dispatch pipeline. A hook that returns an error aborts the
//! surrounding operation before it reaches the backend.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreResult;

/// Operation hooks invoked by the store around mutations.
///
/// All hooks default to pass-through, so implementors only override the
/// ones they care about.
#[async_trait]
pub trait StorePlugin: Send + Sync {
    /// Identifies the plugin in logs and errors.
    fn name(&self) -> &str;

    /// Runs before a `set` is dispatched. An error aborts the set.
    async fn before_set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let _ = (key, value);
        Ok(())
    }

    /// Runs before a `delete` is dispatched. Returning `false` denies the
    /// deletion without error; the delete resolves as a no-op.
    async fn before_delete(&self, key: &str) -> StoreResult<bool> {
        let _ = key;
        Ok(true)
    }

    /// Runs after a successful `delete`.
    async fn after_delete(&self, key: &str) -> StoreResult<()> {
        let _ = key;
        Ok(())
    }

    /// Runs before a `clear` is dispatched.
    async fn on_clear(&self) -> StoreResult<()> {
        Ok(())
    }
}
