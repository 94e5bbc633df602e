//! Integration tests for the four store variants through a provider

use crate::integration::test_utils::{create, create_kv, dict};
use meshstore::store::{AccessPolicy, LocalProvider, StoreKind, StoreProvider};
use meshstore::StoreError;
use serde_json::json;

fn keys(entries: &[meshstore::store::OrderedEntry]) -> Vec<String> {
    entries.iter().map(|e| e.key.clone()).collect()
}

/// put, put, del leaves nothing behind
#[tokio::test]
async fn test_ordered_put_put_del_leaves_no_entry() {
    let provider = LocalProvider::new("alice");
    let address = create(&provider, StoreKind::OrderedKeyValue).await;
    let store = provider.open(&address).await.unwrap();
    let okv = store.ordered_key_value().unwrap();

    okv.put("k", json!("a"), None).await.unwrap();
    okv.put("k", json!("b"), None).await.unwrap();
    okv.del("k").await.unwrap();

    assert!(okv.all().await.unwrap().is_empty());
    assert_eq!(okv.get("k").await.unwrap(), None);
    store.close().await;
}

/// A move after a positioned put decides the final position
#[tokio::test]
async fn test_ordered_move_sets_position() {
    let provider = LocalProvider::new("alice");
    let address = create(&provider, StoreKind::OrderedKeyValue).await;
    let store = provider.open(&address).await.unwrap();
    let okv = store.ordered_key_value().unwrap();

    for key in ["x", "y"] {
        okv.put(key, json!(key), Some(0)).await.unwrap();
    }
    okv.put("k", json!("a"), Some(0)).await.unwrap();
    okv.move_to("k", 2).await.unwrap();

    let all = okv.all().await.unwrap();
    assert_eq!(keys(&all), vec!["x", "y", "k"]);
    assert_eq!(all[2].value, json!("a"));
    assert_eq!(okv.get("k").await.unwrap().and_then(|v| v.position), Some(2));
    store.close().await;
}

/// Older entries spliced at the front shift newer ones back
#[tokio::test]
async fn test_ordered_positions_splice_in_log_order() {
    let provider = LocalProvider::new("alice");
    let address = create(&provider, StoreKind::OrderedKeyValue).await;
    let store = provider.open(&address).await.unwrap();
    let okv = store.ordered_key_value().unwrap();

    okv.put("a", json!(1), Some(0)).await.unwrap();
    okv.put("b", json!(2), Some(0)).await.unwrap();
    okv.put("c", json!(3), Some(1)).await.unwrap();
    assert_eq!(keys(&okv.all().await.unwrap()), vec!["a", "b", "c"]);

    okv.move_to("a", 2).await.unwrap();
    okv.move_to("a", 1).await.unwrap();
    assert_eq!(keys(&okv.all().await.unwrap()), vec!["b", "c", "a"]);
    store.close().await;
}

/// Set keeps one copy of deep-equal values and honours deletes
#[tokio::test]
async fn test_set_semantics_through_provider() {
    let provider = LocalProvider::new("alice");
    let address = create(&provider, StoreKind::Set).await;
    let store = provider.open(&address).await.unwrap();
    let set = store.set().unwrap();

    set.add(json!({"a": 1, "b": 2})).await.unwrap();
    set.add(json!({"b": 2, "a": 1})).await.unwrap();
    set.add(json!("x")).await.unwrap();
    set.del(json!("x")).await.unwrap();

    assert_eq!(set.values().await.unwrap(), vec![json!({"a": 1, "b": 2})]);
    assert!(!set.contains(&json!("x")).await.unwrap());
    store.close().await;
}

/// Feed keeps duplicates; deleting by hash removes one occurrence
#[tokio::test]
async fn test_feed_semantics_through_provider() {
    let provider = LocalProvider::new("alice");
    let address = create(&provider, StoreKind::Feed).await;
    let store = provider.open(&address).await.unwrap();
    let feed = store.feed().unwrap();

    let first = feed.add(json!("a")).await.unwrap();
    feed.add(json!("a")).await.unwrap();
    feed.add(json!("b")).await.unwrap();
    feed.del(&first).await.unwrap();

    assert_eq!(feed.values().await.unwrap(), vec![json!("a"), json!("b")]);
    store.close().await;
}

/// Opening with the wrong variant fails and releases the handle
#[tokio::test]
async fn test_open_as_wrong_kind() {
    let provider = LocalProvider::new("alice");
    let address = create(&provider, StoreKind::Feed).await;
    let err = provider
        .open_as(&address, StoreKind::KeyValue)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TypeMismatch { .. }));
    assert_eq!(provider.open_handles(&address), 0);
}

/// Writers outside the access policy are rejected
#[tokio::test]
async fn test_write_permission_enforced() {
    let alice = LocalProvider::new("alice");
    let address = alice
        .create(StoreKind::KeyValue, AccessPolicy::writers(["alice"]))
        .await
        .unwrap();
    let bob = LocalProvider::new("bob");
    bob.replicate_from(&alice, &address).unwrap();

    let store = bob.open(&address).await.unwrap();
    let err = store.key_value().unwrap().put("k", json!(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied { .. }));
    store.close().await;
}

/// Concurrent writes on two replicas converge after exchanging entries
#[tokio::test]
async fn test_replicas_converge() {
    let alice = LocalProvider::new("alice");
    let address = create_kv(&alice, &[("shared", json!(0))]).await;
    let bob = LocalProvider::new("bob");
    bob.replicate_from(&alice, &address).unwrap();

    let a = alice.open(&address).await.unwrap();
    let b = bob.open(&address).await.unwrap();
    a.key_value().unwrap().put("shared", json!("alice")).await.unwrap();
    a.key_value().unwrap().put("only-alice", json!(1)).await.unwrap();
    b.key_value().unwrap().put("shared", json!("bob")).await.unwrap();
    b.key_value().unwrap().put("only-bob", json!(2)).await.unwrap();
    a.close().await;
    b.close().await;

    alice.replicate_from(&bob, &address).unwrap();
    bob.replicate_from(&alice, &address).unwrap();

    let on_alice = dict(&alice, &address).await;
    let on_bob = dict(&bob, &address).await;
    assert_eq!(on_alice, on_bob);
    assert_eq!(on_alice.len(), 3);

    let store = alice.open(&address).await.unwrap();
    assert_eq!(store.heads().await.unwrap().len(), 2);
    store.close().await;
}
