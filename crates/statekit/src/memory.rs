//! Process-local in-memory backend.
//!
//! The reference [`Backend`] implementation: a JSON object tree behind a
//! `tokio::sync::RwLock`. Used directly in tests and as the memory-kind
//! participant in broadcast synchronization.
//!
//! Key resolution honors both path flavors: an exact top-level hit wins
//! (raw keys are stored and looked up verbatim), otherwise the key is
//! parsed as a dotted/bracketed path and walked.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::action::UpdateEntry;
use crate::backend::{Backend, BackendKind};
use crate::error::{StoreError, StoreResult};
use crate::path::{self, StatePath};

/// In-memory state tree.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tree: RwLock<Map<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a key string to the path it addresses within `tree`.
    fn resolve(tree: &Map<String, Value>, key: &str) -> StatePath {
        if tree.contains_key(key) {
            StatePath::raw(key)
        } else {
            StatePath::parse(key)
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn initialize(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        let tree = self.tree.read().await;
        if path.is_empty() {
            return Ok(Some(Value::Object(tree.clone())));
        }
        let resolved = Self::resolve(&tree, path);
        let root = Value::Object(tree.clone());
        Ok(path::value_at(&root, &resolved).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let mut tree = self.tree.write().await;
        if path.is_empty() {
            let Value::Object(map) = value else {
                return Err(StoreError::InvalidPath(
                    "whole-tree set requires an object value".into(),
                ));
            };
            *tree = map;
            return Ok(());
        }
        let resolved = Self::resolve(&tree, path);
        if resolved.segments().len() == 1 {
            tree.insert(resolved.segments()[0].clone(), value);
        } else {
            let mut root = Value::Object(std::mem::take(&mut *tree));
            path::set_value_at(&mut root, &resolved, value);
            let Value::Object(map) = root else { unreachable!() };
            *tree = map;
        }
        debug!(path, "memory.set");
        Ok(())
    }

    async fn update(&self, entries: Vec<UpdateEntry>) -> StoreResult<()> {
        let mut tree = self.tree.write().await;
        for entry in entries {
            match entry.value {
                Some(value) => {
                    tree.insert(entry.key, value);
                }
                None => {
                    tree.remove(&entry.key);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        let mut tree = self.tree.write().await;
        if tree.remove(path).is_some() {
            debug!(path, "memory.delete");
            return Ok(true);
        }
        let resolved = StatePath::parse(path);
        if resolved.segments().len() < 2 {
            return Ok(false);
        }
        // Nested delete: remove the final segment under its parent.
        let mut root = Value::Object(std::mem::take(&mut *tree));
        let removed = path::remove_value_at(&mut root, &resolved);
        let Value::Object(map) = root else { unreachable!() };
        *tree = map;
        Ok(removed)
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut tree = self.tree.write().await;
        let entries = tree.len();
        tree.clear();
        debug!(entries, "memory.clear");
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let tree = self.tree.read().await;
        Ok(tree.keys().cloned().collect())
    }

    async fn has(&self, path: &str) -> StoreResult<bool> {
        Ok(self.get(path).await?.is_some())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.tree.write().await.clear();
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
