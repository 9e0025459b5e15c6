//! Integration tests for the statekit crate.
//!
//! These exercise the full engine through its public API: the middleware
//! chain, subscriptions, diff-driven notifications, selectors and the
//! broadcast sync protocol working together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use statekit::{
    BatchConfig, BatchMiddleware, SelectorRegistry, ShallowCompareMiddleware, StateStore,
    StoreError, StoreStatus, SyncChannelHub, SyncMiddleware,
};

// ═══════════════════════════════════════════════════════════════════════
//  Core scenario
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn counter_lifecycle_scenario() {
    let store = StateStore::builder("counter").build();
    store.initialize().await.unwrap();
    store.set("count", json!(0)).await.unwrap();

    let mut global = store.subscribe_all().await.unwrap();
    global.recv().await.unwrap(); // initial replay

    store
        .update(|state| {
            state["count"] = json!(1);
        })
        .await
        .unwrap();

    let change = global.recv().await.unwrap();
    assert_eq!(change.keys, ["count"]);
    assert_eq!(change.value, Some(json!({"count": 1})));
    assert_eq!(change.changed_paths, ["count"]);

    assert!(store.delete("count").await.unwrap());
    assert_eq!(store.get("count").await.unwrap(), None);

    store.clear().await.unwrap();
    assert!(store.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn round_trip_for_json_shapes() {
    let store = StateStore::builder("shapes").build();
    store.initialize().await.unwrap();

    let values = [
        json!(null),
        json!(true),
        json!(42),
        json!(-0.5),
        json!("text"),
        json!([1, [2, [3]]]),
        json!({"nested": {"deep": {"mixed": [1, "two", {"three": 3}]}}}),
    ];
    for (i, value) in values.iter().enumerate() {
        let key = format!("k{i}");
        store.set(&key, value.clone()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_ref(), Some(value));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Failure paths
// ═══════════════════════════════════════════════════════════════════════

mod failing {
    use async_trait::async_trait;
    use serde_json::Value;
    use statekit::{Backend, BackendKind, StoreError, StoreResult, UpdateEntry};

    /// A backend whose medium never comes up.
    pub struct BrokenBackend;

    #[async_trait]
    impl Backend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }

        async fn initialize(&self) -> StoreResult<()> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn get(&self, _path: &str) -> StoreResult<Option<Value>> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn set(&self, _path: &str, _value: Value) -> StoreResult<()> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn update(&self, _entries: Vec<UpdateEntry>) -> StoreResult<()> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn delete(&self, _path: &str) -> StoreResult<bool> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn clear(&self) -> StoreResult<()> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn keys(&self) -> StoreResult<Vec<String>> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn has(&self, _path: &str) -> StoreResult<bool> {
            Err(StoreError::Backend("medium unavailable".into()))
        }

        async fn destroy(&self) -> StoreResult<()> {
            Ok(())
        }
    }
}

#[tokio::test]
async fn failed_initialize_is_observable_and_retryable() {
    let store = StateStore::builder("broken")
        .backend(Arc::new(failing::BrokenBackend))
        .build();

    let err = store.initialize().await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));
    assert!(matches!(store.status(), StoreStatus::Error(_)));

    // Data operations keep failing fast, naming the state.
    let err = store.set("k", json!(1)).await.unwrap_err();
    match err {
        StoreError::NotReady { status, .. } => assert!(status.starts_with("error")),
        other => panic!("unexpected error: {other}"),
    }

    // A fresh attempt is allowed (and fails the same way here).
    assert!(store.initialize().await.is_err());
}

// ═══════════════════════════════════════════════════════════════════════
//  Full pipeline composition
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn replicated_batched_stores_converge() {
    let hub = SyncChannelHub::new();

    let build = |name: &str| {
        StateStore::builder(name)
            // Sync sits outermost so completed writes are mirrored even
            // when batching defers them.
            .middleware(Arc::new(
                SyncMiddleware::new(hub.clone(), "app").timeout(Duration::from_millis(100)),
            ))
            .middleware(Arc::new(BatchMiddleware::new(BatchConfig {
                delay: Duration::from_millis(10),
                max_batch: 8,
            })))
            .middleware(Arc::new(ShallowCompareMiddleware::new()))
            .build()
    };

    let first = build("first");
    first.initialize().await.unwrap();
    first.set("seed", json!("value")).await.unwrap();

    // The second participant bootstraps from the first's snapshot.
    let second = build("second");
    second.initialize().await.unwrap();
    assert_eq!(second.get("seed").await.unwrap(), Some(json!("value")));

    // A burst of writes merges into one flush and still replicates.
    let mut watching = second.subscribe("burst").await.unwrap();
    watching.recv().await.unwrap();

    let (r1, r2, r3) = tokio::join!(
        first.set("burst", json!(1)),
        first.set("burst", json!(2)),
        first.set("burst", json!(3)),
    );
    assert_eq!(r1.unwrap(), Some(json!(3)));
    assert_eq!(r2.unwrap(), Some(json!(3)));
    assert_eq!(r3.unwrap(), Some(json!(3)));

    let change = watching.recv().await.unwrap();
    assert_eq!(change.value, Some(json!(3)));
    assert_eq!(second.get("burst").await.unwrap(), Some(json!(3)));
}

#[tokio::test]
async fn selectors_ride_on_store_subscriptions() {
    let store = StateStore::builder("derived").build();
    store.initialize().await.unwrap();
    store.set("todos", json!([{"done": true}, {"done": false}])).await.unwrap();

    let registry = SelectorRegistry::new(store.clone());
    let open = registry.define("open-todos", |state| {
        let open = state["todos"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item["done"] == json!(false))
                    .count()
            })
            .unwrap_or(0);
        json!(open)
    });

    let mut sub = open.subscribe().await.unwrap();
    assert_eq!(sub.recv().await, Some(json!(1)));

    store
        .update(|state| {
            state["todos"].as_array_mut().unwrap().push(json!({"done": false}));
        })
        .await
        .unwrap();
    assert_eq!(sub.recv().await, Some(json!(2)));

    // Marking an already-counted field identically does not re-notify.
    store.set("unrelated", json!("noise")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(sub.try_recv().is_none());

    open.destroy().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn destroy_tears_down_the_composition() {
    let hub = SyncChannelHub::new();
    let store = StateStore::builder("teardown")
        .middleware(Arc::new(
            SyncMiddleware::new(hub.clone(), "teardown").timeout(Duration::from_millis(50)),
        ))
        .middleware(Arc::new(BatchMiddleware::new(BatchConfig::default())))
        .build();
    store.initialize().await.unwrap();
    store.set("k", json!(1)).await.unwrap();

    store.destroy().await.unwrap();
    assert!(matches!(
        store.get("k").await.unwrap_err(),
        StoreError::Destroyed(_)
    ));
}
