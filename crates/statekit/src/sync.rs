//! Best-effort state replication across sibling stores.
//!
//! Stores that share a named channel on a [`SyncChannelHub`], but no
//! memory, mirror each other's mutations and bootstrap new participants
//! with a snapshot handshake. The hub is an explicit instance handed to
//! each participant; topics are point-to-multipoint
//! [`tokio::sync::broadcast`] channels.
//!
//! # Protocol
//!
//! - Every participant has a random session id. A receiver discards any
//!   message whose sender equals its own id, so a mutation is never
//!   re-applied from its own echo.
//! - Memory-kind participants answer `SyncRequest` with a whole-state
//!   snapshot addressed to the requester, and send one themselves at
//!   setup, waiting a bounded time before proceeding with local state.
//! - Every local mutation is re-broadcast after the inner operation
//!   completes. A peer's mutation is applied through the raw backend
//!   operations (memory kind) or merely re-read and re-notified
//!   (shared-medium kind, whose medium already reflects the write).
//! - Malformed peer messages are logged and discarded, never surfaced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::action::{Action, ActionKind, ActionOutcome, UpdateEntry};
use crate::backend::BackendKind;
use crate::error::{StoreError, StoreResult};
use crate::path::StatePath;
use crate::pipeline::{Middleware, MiddlewareApi, Next};

/// What a [`SyncMessage`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessageKind {
    SyncRequest,
    SyncResponse,
    Mutation,
}

/// One message on a sync channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: SyncMessageKind,
    pub payload: Value,
    /// Session id of the sender; receivers drop their own echoes.
    pub sender: Uuid,
    /// For responses: the requester this message is addressed to.
    pub target: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// One `{key, value}` pair inside a snapshot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub key: String,
    pub value: Value,
}

/// Named point-to-multipoint channels connecting sync participants.
///
/// Cheaply cloneable; participants that should see each other share one
/// hub instance and one channel name (conventionally the store name).
#[derive(Clone, Default)]
pub struct SyncChannelHub {
    topics: Arc<DashMap<String, broadcast::Sender<SyncMessage>>>,
}

impl SyncChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> broadcast::Sender<SyncMessage> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Join a channel, receiving all messages sent after this call.
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<SyncMessage> {
        self.topic(name).subscribe()
    }

    /// Send to every current participant; returns how many will see it.
    pub fn send(&self, name: &str, message: SyncMessage) -> usize {
        self.topic(name).send(message).unwrap_or(0)
    }
}

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Vec<SyncUpdate>>>>>;

/// The replication interceptor. Register once per store; all stores that
/// should stay in sync use the same hub and channel name.
pub struct SyncMiddleware {
    channel: String,
    hub: SyncChannelHub,
    session: Uuid,
    timeout: Duration,
    pending: Pending,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncMiddleware {
    pub fn new(hub: SyncChannelHub, channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            hub,
            session: Uuid::now_v7(),
            timeout: Duration::from_secs(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    /// Override the snapshot-handshake timeout (default 1 s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// This participant's session identity.
    pub fn session(&self) -> Uuid {
        self.session
    }

    fn message(&self, kind: SyncMessageKind, payload: Value, target: Option<Uuid>) -> SyncMessage {
        SyncMessage {
            kind,
            payload,
            sender: self.session,
            target,
            timestamp: Utc::now(),
        }
    }

    /// Ask peers for a snapshot and apply the first addressed response.
    /// Timing out is not an error: the participant proceeds with local
    /// state unchanged.
    async fn handshake(&self, api: &MiddlewareApi) -> StoreResult<()> {
        let request_id = Uuid::now_v7();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("sync pending poisoned")
            .insert(request_id, tx);
        self.hub.send(
            &self.channel,
            self.message(
                SyncMessageKind::SyncRequest,
                json!({ "request": request_id }),
                None,
            ),
        );
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(updates)) => {
                debug!(updates = updates.len(), "applying snapshot from peer");
                apply_snapshot(api, updates).await
            }
            Ok(Err(_)) => Err(StoreError::ChannelClosed),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("sync pending poisoned")
                    .remove(&request_id);
                debug!(channel = %self.channel, "no peer answered sync request");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Middleware for SyncMiddleware {
    fn name(&self) -> &str {
        "broadcast-sync"
    }

    async fn setup(&self, api: MiddlewareApi) -> StoreResult<()> {
        let kind = api.backend_kind()?;
        let rx = self.hub.subscribe(&self.channel);
        let task = tokio::spawn(listen(
            rx,
            api.clone(),
            self.hub.clone(),
            self.channel.clone(),
            self.session,
            kind,
            Arc::clone(&self.pending),
        ));
        if let Some(previous) = self
            .listener
            .lock()
            .expect("sync listener poisoned")
            .replace(task)
        {
            previous.abort();
        }
        // Durable media are already shared by the platform; only a
        // process-local backend needs a peer's snapshot.
        if kind == BackendKind::Memory {
            self.handshake(&api).await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> StoreResult<()> {
        if let Some(task) = self.listener.lock().expect("sync listener poisoned").take() {
            task.abort();
        }
        // Dropping the senders rejects every pending request as closed.
        self.pending.lock().expect("sync pending poisoned").clear();
        Ok(())
    }

    async fn handle(&self, action: Action, next: Next<'_>) -> StoreResult<ActionOutcome> {
        let mirror = action.kind.is_mutation().then(|| action.clone());
        let outcome = next.run(action).await?;
        if outcome.is_unchanged() {
            return Ok(outcome);
        }
        if let Some(mut action) = mirror {
            if action.kind == ActionKind::Set {
                if let ActionOutcome::Value(Some(value)) = &outcome {
                    // Mirror what was actually committed: a batch may have
                    // merged this caller's write with later ones.
                    action.value = Some(value.clone());
                }
            }
            match serde_json::to_value(&action) {
                Ok(payload) => {
                    let receivers = self.hub.send(
                        &self.channel,
                        self.message(SyncMessageKind::Mutation, payload, None),
                    );
                    trace!(kind = action.kind.as_str(), receivers, "mutation broadcast");
                }
                Err(err) => warn!(error = %err, "mutation not serializable for broadcast"),
            }
        }
        Ok(outcome)
    }
}

/// Receive loop of one participant.
async fn listen(
    mut rx: broadcast::Receiver<SyncMessage>,
    api: MiddlewareApi,
    hub: SyncChannelHub,
    channel: String,
    session: Uuid,
    kind: BackendKind,
    pending: Pending,
) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "sync listener lagged behind the channel");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if message.sender == session {
            continue;
        }
        let result = match message.kind {
            SyncMessageKind::SyncRequest => {
                handle_sync_request(&api, &hub, &channel, session, kind, message).await
            }
            SyncMessageKind::SyncResponse => {
                handle_sync_response(session, &pending, message);
                Ok(())
            }
            SyncMessageKind::Mutation => handle_peer_mutation(&api, kind, message).await,
        };
        if let Err(err) = result {
            // A peer's bad message must never take the local store down.
            warn!(error = %err, "sync message handling failed");
        }
    }
}

async fn handle_sync_request(
    api: &MiddlewareApi,
    hub: &SyncChannelHub,
    channel: &str,
    session: Uuid,
    kind: BackendKind,
    message: SyncMessage,
) -> StoreResult<()> {
    // Only memory-kind participants serve snapshots; shared media are
    // visible to the requester through their own medium.
    if kind != BackendKind::Memory {
        return Ok(());
    }
    let request_id = message.payload.get("request").cloned().unwrap_or(Value::Null);
    let state = api.state().await?;
    let updates: Vec<SyncUpdate> = match state {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| SyncUpdate { key, value })
            .collect(),
        _ => Vec::new(),
    };
    debug!(updates = updates.len(), requester = %message.sender, "answering sync request");
    hub.send(
        channel,
        SyncMessage {
            kind: SyncMessageKind::SyncResponse,
            payload: json!({ "request": request_id, "updates": updates }),
            sender: session,
            target: Some(message.sender),
            timestamp: Utc::now(),
        },
    );
    Ok(())
}

fn handle_sync_response(session: Uuid, pending: &Pending, message: SyncMessage) {
    if message.target != Some(session) {
        return;
    }
    let Some(updates) = parse_updates(&message.payload) else {
        warn!(sender = %message.sender, "discarding malformed sync response");
        return;
    };
    let request_id = message
        .payload
        .get("request")
        .and_then(|value| serde_json::from_value::<Uuid>(value.clone()).ok());
    let mut pending = pending.lock().expect("sync pending poisoned");
    // Loose correlation: an unmarked response satisfies any waiter.
    let fallback = pending.keys().next().copied();
    let waiter = match request_id {
        Some(id) => pending.remove(&id),
        None => fallback.and_then(|id| pending.remove(&id)),
    };
    if let Some(tx) = waiter {
        let _ = tx.send(updates);
    }
}

/// Validate a response payload: an `updates` array whose every element
/// carries `key` and `value`.
fn parse_updates(payload: &Value) -> Option<Vec<SyncUpdate>> {
    let items = payload.get("updates")?.as_array()?;
    let mut updates = Vec::with_capacity(items.len());
    for item in items {
        let object = item.as_object()?;
        let key = object.get("key")?.as_str()?;
        let value = object.get("value")?;
        updates.push(SyncUpdate {
            key: key.to_string(),
            value: value.clone(),
        });
    }
    Some(updates)
}

/// Apply a snapshot through the raw backend operations and synthesize
/// notifications, bypassing the pipeline so a reply never re-broadcasts.
async fn apply_snapshot(api: &MiddlewareApi, updates: Vec<SyncUpdate>) -> StoreResult<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let changed: Vec<StatePath> = updates
        .iter()
        .map(|update| StatePath::raw(&update.key))
        .collect();
    let entries = updates
        .into_iter()
        .map(|update| UpdateEntry {
            key: update.key,
            value: Some(update.value),
        })
        .collect();
    api.raw_update(entries).await?;
    api.notify(changed).await
}

/// Mirror a peer's mutation locally.
async fn handle_peer_mutation(
    api: &MiddlewareApi,
    kind: BackendKind,
    message: SyncMessage,
) -> StoreResult<()> {
    let Ok(action) = serde_json::from_value::<Action>(message.payload.clone()) else {
        warn!(sender = %message.sender, "discarding malformed peer mutation");
        return Ok(());
    };
    let changed: Vec<StatePath> = match action.kind {
        ActionKind::Set | ActionKind::Delete => {
            vec![StatePath::parse(action.key.as_deref().unwrap_or_default())]
        }
        ActionKind::Update => action
            .entries
            .iter()
            .map(|entry| StatePath::raw(&entry.key))
            .collect(),
        ActionKind::Clear => Vec::new(),
        // Non-mutations are never broadcast; ignore defensively crafted ones.
        _ => return Ok(()),
    };
    if kind == BackendKind::Memory {
        match action.kind {
            ActionKind::Set => {
                let key = action.key.unwrap_or_default();
                api.raw_set(&key, action.value.unwrap_or(Value::Null)).await?;
            }
            ActionKind::Update => {
                api.raw_update(action.entries).await?;
            }
            ActionKind::Delete => {
                let key = action.key.unwrap_or_default();
                api.raw_delete(&key).await?;
            }
            ActionKind::Clear => {
                api.raw_clear().await?;
            }
            _ => unreachable!("filtered above"),
        }
    }
    // Shared media already hold the peer's write; both kinds re-read the
    // affected paths and notify local subscribers.
    api.notify(changed).await
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::memory::MemoryBackend;
    use crate::store::StateStore;
    use serde_json::json;

    const TEST_TIMEOUT: Duration = Duration::from_millis(100);

    async fn sync_store(name: &str, hub: &SyncChannelHub) -> StateStore {
        let store = StateStore::builder(name)
            .middleware(Arc::new(
                SyncMiddleware::new(hub.clone(), "shared").timeout(TEST_TIMEOUT),
            ))
            .build();
        store.initialize().await.unwrap();
        store
    }

    /// A memory tree that reports itself as a platform-shared medium.
    struct SharedMediumBackend(MemoryBackend);

    #[async_trait]
    impl Backend for SharedMediumBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::SharedMedium
        }

        async fn initialize(&self) -> StoreResult<()> {
            self.0.initialize().await
        }

        async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
            self.0.get(path).await
        }

        async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
            self.0.set(path, value).await
        }

        async fn update(&self, entries: Vec<UpdateEntry>) -> StoreResult<()> {
            self.0.update(entries).await
        }

        async fn delete(&self, path: &str) -> StoreResult<bool> {
            self.0.delete(path).await
        }

        async fn clear(&self) -> StoreResult<()> {
            self.0.clear().await
        }

        async fn keys(&self) -> StoreResult<Vec<String>> {
            self.0.keys().await
        }

        async fn has(&self, path: &str) -> StoreResult<bool> {
            self.0.has(path).await
        }

        async fn destroy(&self) -> StoreResult<()> {
            self.0.destroy().await
        }
    }

    #[tokio::test]
    async fn lone_participant_initializes_after_timeout() {
        let hub = SyncChannelHub::new();
        let store = sync_store("lonely", &hub).await;
        store.set("k", json!(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn new_participant_receives_snapshot() {
        let hub = SyncChannelHub::new();
        let first = sync_store("first", &hub).await;
        first.set("greeting", json!("hello")).await.unwrap();
        first.set("count", json!(3)).await.unwrap();

        // The second store handshakes during initialize and starts with
        // the first store's state.
        let second = sync_store("second", &hub).await;
        assert_eq!(
            second.get("greeting").await.unwrap(),
            Some(json!("hello"))
        );
        assert_eq!(second.get("count").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn mutations_replicate_to_peers() {
        let hub = SyncChannelHub::new();
        let first = sync_store("a", &hub).await;
        let second = sync_store("b", &hub).await;

        let mut sub = second.subscribe("shared_key").await.unwrap();
        sub.recv().await.unwrap(); // initial replay (None)

        first.set("shared_key", json!({"v": 1})).await.unwrap();

        let change = sub.recv().await.unwrap();
        assert_eq!(change.value, Some(json!({"v": 1})));
        assert_eq!(
            second.get("shared_key").await.unwrap(),
            Some(json!({"v": 1}))
        );

        // Deletes replicate too.
        first.delete("shared_key").await.unwrap();
        let change = sub.recv().await.unwrap();
        assert_eq!(change.value, None);
    }

    #[tokio::test]
    async fn own_echo_is_never_reapplied() {
        let hub = SyncChannelHub::new();
        let store = sync_store("echo", &hub).await;
        // Keep a receiver alive so broadcasts are actually delivered.
        let _rx = hub.subscribe("shared");

        store.set("k", json!(1)).await.unwrap();
        let version = store.version();

        // Give a hypothetical echo time to land; the version must not move.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.version(), version);
    }

    #[tokio::test]
    async fn malformed_peer_messages_are_discarded() {
        let hub = SyncChannelHub::new();
        let store = sync_store("robust", &hub).await;

        hub.send(
            "shared",
            SyncMessage {
                kind: SyncMessageKind::Mutation,
                payload: json!("this is not an action"),
                sender: Uuid::now_v7(),
                target: None,
                timestamp: Utc::now(),
            },
        );
        hub.send(
            "shared",
            SyncMessage {
                kind: SyncMessageKind::SyncResponse,
                payload: json!({"updates": [{"key": "x"}]}),
                sender: Uuid::now_v7(),
                target: None,
                timestamp: Utc::now(),
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The store still works.
        store.set("alive", json!(true)).await.unwrap();
        assert_eq!(store.get("alive").await.unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn shared_medium_backend_refreshes_without_reapplying() {
        let hub = SyncChannelHub::new();
        let memory_peer = sync_store("writer", &hub).await;

        let durable = StateStore::builder("durable")
            .backend(Arc::new(SharedMediumBackend(MemoryBackend::new())))
            .middleware(Arc::new(
                SyncMiddleware::new(hub.clone(), "shared").timeout(TEST_TIMEOUT),
            ))
            .build();
        durable.initialize().await.unwrap();

        let mut sub = durable.subscribe("doc").await.unwrap();
        sub.recv().await.unwrap();
        let version_before = durable.version();

        memory_peer.set("doc", json!("payload")).await.unwrap();

        // The durable participant re-reads and notifies, but does not
        // write the payload into its backend (the medium is presumed to
        // reflect it already; here the two trees are separate, so the
        // refreshed read stays empty).
        let change = sub.recv().await.unwrap();
        assert_eq!(change.value, None);
        assert!(durable.version() > version_before);
        assert_eq!(durable.get("doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn validation_rejects_partial_updates() {
        assert!(parse_updates(&json!({"updates": [{"key": "a", "value": 1}]})).is_some());
        assert!(parse_updates(&json!({"updates": [{"key": "a"}]})).is_none());
        assert!(parse_updates(&json!({"updates": [{"value": 1}]})).is_none());
        assert!(parse_updates(&json!({"updates": "nope"})).is_none());
        assert!(parse_updates(&json!({})).is_none());
    }
}
