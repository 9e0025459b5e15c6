//! Subscriber registry and change notifications.
//!
//! Consumers subscribe to a [`StatePath`] (or the reserved global path) and
//! receive [`StateChange`] values over an unbounded channel. Dropping the
//! returned [`Subscription`] unregisters it; a path whose last subscriber
//! is gone is removed from the registry entirely, so the registry never
//! leaks empty entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::path::{self, StatePath, GLOBAL_PATH};

/// A change delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// The changed top-level keys.
    pub keys: Vec<String>,
    /// For a path subscriber: the value now at the subscribed path.
    /// For a global subscriber: the full new state.
    pub value: Option<Value>,
    /// Every changed path, as dotted strings.
    pub changed_paths: Vec<String>,
}

struct SubscriberEntry {
    id: Uuid,
    path: StatePath,
    tx: mpsc::UnboundedSender<StateChange>,
}

/// Registry mapping path strings to live subscriber channels.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    entries: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `path` and hand back its receiving end.
    pub fn add(self: &Arc<Self>, path: StatePath) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();
        let key = registry_key(&path);
        let entry = SubscriberEntry {
            id,
            path,
            tx,
        };
        self.entries
            .lock()
            .expect("subscriber registry poisoned")
            .entry(key.clone())
            .or_default()
            .push(entry);
        trace!(path = %key, %id, "subscriber added");
        Subscription {
            id,
            key,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Register a global subscriber receiving every structural change.
    pub fn add_global(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();
        self.entries
            .lock()
            .expect("subscriber registry poisoned")
            .entry(GLOBAL_PATH.to_string())
            .or_default()
            .push(SubscriberEntry {
                id,
                path: StatePath::root(),
                tx,
            });
        Subscription {
            id,
            key: GLOBAL_PATH.to_string(),
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Notify every subscriber whose path lies on the same branch as one of
    /// `changed`, reading each subscriber's value at its own path from
    /// `tree`. Global subscribers receive the full tree.
    pub fn notify(&self, keys: &[String], changed: &[StatePath], tree: &Value) {
        let changed_paths: Vec<String> = changed.iter().map(|p| p.to_string()).collect();
        let mut entries = self.entries.lock().expect("subscriber registry poisoned");
        for (key, subscribers) in entries.iter_mut() {
            if key == GLOBAL_PATH {
                subscribers.retain(|entry| {
                    entry
                        .tx
                        .send(StateChange {
                            keys: keys.to_vec(),
                            value: Some(tree.clone()),
                            changed_paths: changed_paths.clone(),
                        })
                        .is_ok()
                });
                continue;
            }
            subscribers.retain(|entry| {
                if !changed.iter().any(|c| c.is_related(&entry.path)) {
                    return !entry.tx.is_closed();
                }
                entry
                    .tx
                    .send(StateChange {
                        keys: keys.to_vec(),
                        value: path::value_at(tree, &entry.path).cloned(),
                        changed_paths: changed_paths.clone(),
                    })
                    .is_ok()
            });
        }
        entries.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Drop every subscriber (store teardown).
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("subscriber registry poisoned")
            .clear();
    }

    /// Total live subscribers across all paths.
    pub fn count(&self) -> usize {
        self.entries
            .lock()
            .expect("subscriber registry poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    fn remove(&self, key: &str, id: Uuid) {
        let mut entries = self.entries.lock().expect("subscriber registry poisoned");
        if let Some(subscribers) = entries.get_mut(key) {
            subscribers.retain(|entry| entry.id != id);
            if subscribers.is_empty() {
                entries.remove(key);
            }
        }
    }
}

fn registry_key(path: &StatePath) -> String {
    if path.is_root() {
        GLOBAL_PATH.to_string()
    } else {
        path.to_string()
    }
}

/// A live subscription; unregisters itself on drop.
pub struct Subscription {
    id: Uuid,
    key: String,
    rx: mpsc::UnboundedReceiver<StateChange>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    /// Await the next change. Returns `None` once the store is destroyed.
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.rx.recv().await
    }

    /// Poll for an already-delivered change without waiting.
    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.rx.try_recv().ok()
    }

    /// The registry key this subscription listens under.
    pub fn path(&self) -> &str {
        &self.key
    }

    pub(crate) fn push(&self, change: StateChange) {
        // Initial replay: the registry holds our sender, so route through it.
        if let Some(registry) = self.registry.upgrade() {
            let entries = registry.entries.lock().expect("subscriber registry poisoned");
            if let Some(subscribers) = entries.get(&self.key) {
                if let Some(entry) = subscribers.iter().find(|e| e.id == self.id) {
                    let _ = entry.tx.send(change);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
            trace!(path = %self.key, id = %self.id, "subscriber removed");
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change_for(sub: &mut Subscription) -> Option<StateChange> {
        sub.try_recv()
    }

    #[tokio::test]
    async fn path_subscriber_receives_value_at_own_path() {
        let registry = Arc::new(SubscriberRegistry::new());
        let mut sub = registry.add(StatePath::parse("a.b"));

        let tree = json!({"a": {"b": 5}});
        registry.notify(
            &["a".to_string()],
            &[StatePath::parse("a.b")],
            &tree,
        );

        let change = change_for(&mut sub).expect("should be notified");
        assert_eq!(change.value, Some(json!(5)));
        assert_eq!(change.keys, ["a"]);
        assert_eq!(change.changed_paths, ["a.b"]);
    }

    #[tokio::test]
    async fn unrelated_sibling_is_not_notified() {
        let registry = Arc::new(SubscriberRegistry::new());
        let mut related = registry.add(StatePath::parse("a"));
        let mut sibling = registry.add(StatePath::parse("z"));

        registry.notify(
            &["a".to_string()],
            &[StatePath::parse("a.b")],
            &json!({"a": {"b": 1}, "z": 0}),
        );

        assert!(change_for(&mut related).is_some());
        assert!(change_for(&mut sibling).is_none());
    }

    #[tokio::test]
    async fn global_subscriber_receives_full_tree() {
        let registry = Arc::new(SubscriberRegistry::new());
        let mut sub = registry.add_global();

        let tree = json!({"count": 1});
        registry.notify(
            &["count".to_string()],
            &[StatePath::parse("count")],
            &tree,
        );

        let change = change_for(&mut sub).expect("global notified");
        assert_eq!(change.value, Some(tree));
        assert_eq!(change.keys, ["count"]);
    }

    #[tokio::test]
    async fn dropped_subscription_is_unregistered() {
        let registry = Arc::new(SubscriberRegistry::new());
        let sub = registry.add(StatePath::parse("a"));
        assert_eq!(registry.count(), 1);

        drop(sub);
        assert_eq!(registry.count(), 0);
        // The path entry itself is gone, not just empty.
        assert!(registry
            .entries
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn descendant_subscriber_sees_ancestor_change() {
        let registry = Arc::new(SubscriberRegistry::new());
        let mut sub = registry.add(StatePath::parse("a.b.c"));

        // The whole of "a.b" was replaced; "a.b.c" lies on that branch.
        registry.notify(
            &["a".to_string()],
            &[StatePath::parse("a.b")],
            &json!({"a": {"b": {"c": 7}}}),
        );

        let change = change_for(&mut sub).expect("notified");
        assert_eq!(change.value, Some(json!(7)));
    }
}
