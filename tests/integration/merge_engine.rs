//! Integration tests for the merge engine

use crate::integration::test_utils::{create, create_kv, create_set, dict, engine_over, set_values};
use meshstore::merge::MergeTask;
use meshstore::store::{AccessPolicy, LocalProvider, StoreKind, StoreProvider};
use meshstore::{EngineError, StoreError, Value};
use serde_json::json;

fn row(value: &Value, k: &str) -> Option<Value> {
    value
        .as_object()
        .filter(|obj| obj.get("k") == Some(&json!(k)))
        .and_then(|obj| obj.get("v").cloned())
}

/// Rows matched by identity field: base wins, gaps filled, new rows added
#[tokio::test]
async fn test_indexed_set_merge_table_rows() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let base = create_set(
        &provider,
        &[json!({"k": "fr", "v": "Constellation"}), json!({"k": "kaq"})],
    )
    .await;
    let incoming = create_set(
        &provider,
        &[
            json!({"k": "fr", "v": "Constellation!"}),
            json!({"k": "kaq", "v": "Ch'umil"}),
            json!({"k": "हिं", "v": "तारामंडल"}),
        ],
    )
    .await;

    let task = MergeTask::new(base.clone(), incoming.clone()).with_identity_fields(["k"]);
    let report = engine.merger().merge(task.clone()).await.unwrap();
    assert_eq!(report.conflicts, 1);

    let rows = set_values(&provider, &base).await;
    assert_eq!(rows.len(), 3);
    let find = |k: &str| rows.iter().find_map(|r| row(r, k));
    assert_eq!(find("fr"), Some(json!("Constellation")));
    assert_eq!(find("kaq"), Some(json!("Ch'umil")));
    assert_eq!(find("हिं"), Some(json!("तारामंडल")));

    let again = engine.merger().merge(task).await.unwrap();
    assert_eq!(again.writes, 0);
    assert_eq!(set_values(&provider, &base).await, rows);
    assert_eq!(provider.total_open_handles(), 0);
}

/// Non-dictionary elements cannot be matched by identity fields
#[tokio::test]
async fn test_indexed_set_rejects_scalar_elements() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let base = create_set(&provider, &[]).await;
    let incoming = create_set(&provider, &[json!("plain")]).await;

    let task = MergeTask::new(base, incoming).with_identity_fields(["k"]);
    let err = engine.merger().merge(task).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidElement(_)));
    assert_eq!(provider.total_open_handles(), 0);
}

/// Plain sets only gain missing values
#[tokio::test]
async fn test_unindexed_set_merge_adds_missing_values() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let base = create_set(&provider, &[json!(1), json!({"a": [1, 2]})]).await;
    let incoming = create_set(&provider, &[json!({"a": [1, 2]}), json!(3)]).await;

    let report = engine
        .merger()
        .merge_into(base.as_str(), incoming.as_str())
        .await
        .unwrap();
    assert_eq!(report.writes, 1);
    assert_eq!(
        set_values(&provider, &base).await,
        vec![json!(1), json!({"a": [1, 2]}), json!(3)]
    );
}

/// Nested stores under the same key are merged recursively
#[tokio::test]
async fn test_nested_key_value_merge_is_idempotent() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let base_child = create_kv(&provider, &[("x", json!(1))]).await;
    let incoming_child = create_kv(&provider, &[("x", json!(2)), ("y", json!(3))]).await;
    let base = create_kv(&provider, &[("child", base_child.to_value()), ("kept", json!("base"))]).await;
    let incoming = create_kv(
        &provider,
        &[("child", incoming_child.to_value()), ("kept", json!("incoming")), ("new", json!(true))],
    )
    .await;

    let first = engine
        .merger()
        .merge_into(base.as_str(), incoming.as_str())
        .await
        .unwrap();
    assert_eq!(first.nested, 1);
    assert_eq!(first.writes, 2);

    let top = dict(&provider, &base).await;
    assert_eq!(top.get("child"), Some(&base_child.to_value()));
    assert_eq!(top.get("kept"), Some(&json!("base")));
    assert_eq!(top.get("new"), Some(&json!(true)));
    let nested = dict(&provider, &base_child).await;
    assert_eq!(nested.get("x"), Some(&json!(1)));
    assert_eq!(nested.get("y"), Some(&json!(3)));

    let second = engine
        .merger()
        .merge_into(base.as_str(), incoming.as_str())
        .await
        .unwrap();
    assert_eq!(second.writes, 0);
    assert_eq!(dict(&provider, &base).await, top);
    assert_eq!(dict(&provider, &base_child).await, nested);
}

/// Merging a store into itself writes nothing
#[tokio::test]
async fn test_self_merge_is_noop() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let x = create_kv(&provider, &[("a", json!(1))]).await;
    let before = dict(&provider, &x).await;

    let report = engine.merger().merge_into(x.as_str(), x.as_str()).await.unwrap();
    assert_eq!(report.writes, 0);
    assert_eq!(dict(&provider, &x).await, before);
}

/// Ordered stores gain missing keys at their incoming position
#[tokio::test]
async fn test_ordered_merge_inserts_at_incoming_position() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let base = create(&provider, StoreKind::OrderedKeyValue).await;
    let incoming = create(&provider, StoreKind::OrderedKeyValue).await;
    {
        let store = provider.open(&base).await.unwrap();
        store.ordered_key_value().unwrap().put("x", json!("bx"), None).await.unwrap();
        store.close().await;
        let store = provider.open(&incoming).await.unwrap();
        let okv = store.ordered_key_value().unwrap();
        okv.put("y", json!("iy"), None).await.unwrap();
        okv.put("x", json!("ix"), None).await.unwrap();
        store.close().await;
    }

    engine
        .merger()
        .merge_into(base.as_str(), incoming.as_str())
        .await
        .unwrap();

    let store = provider.open(&base).await.unwrap();
    let all = store.ordered_key_value().unwrap().all().await.unwrap();
    store.close().await;
    let pairs: Vec<(String, Value)> = all.into_iter().map(|e| (e.key, e.value)).collect();
    assert_eq!(
        pairs,
        vec![("y".to_string(), json!("iy")), ("x".to_string(), json!("bx"))]
    );
}

/// Feeds gain values they do not already hold
#[tokio::test]
async fn test_feed_merge() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let base = create(&provider, StoreKind::Feed).await;
    let incoming = create(&provider, StoreKind::Feed).await;
    {
        let store = provider.open(&base).await.unwrap();
        store.feed().unwrap().add(json!("a")).await.unwrap();
        store.close().await;
        let store = provider.open(&incoming).await.unwrap();
        let feed = store.feed().unwrap();
        feed.add(json!("a")).await.unwrap();
        feed.add(json!("b")).await.unwrap();
        store.close().await;
    }

    let report = engine
        .merger()
        .merge_into(base.as_str(), incoming.as_str())
        .await
        .unwrap();
    assert_eq!(report.writes, 1);

    let store = provider.open(&base).await.unwrap();
    assert_eq!(store.feed().unwrap().values().await.unwrap(), vec![json!("a"), json!("b")]);
    store.close().await;
}

/// A rejected nested write surfaces to the caller; earlier writes stay
#[tokio::test]
async fn test_nested_permission_denied_is_partial() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let locked = provider
        .create(StoreKind::KeyValue, AccessPolicy::writers(["carol"]))
        .await
        .unwrap();
    let incoming_child = create_kv(&provider, &[("x", json!(1))]).await;
    let base = create_kv(&provider, &[("z", locked.to_value())]).await;
    let incoming = create_kv(&provider, &[("a", json!(1)), ("z", incoming_child.to_value())]).await;

    let err = engine
        .merger()
        .merge_into(base.as_str(), incoming.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::PermissionDenied { .. })));
    assert_eq!(dict(&provider, &base).await.get("a"), Some(&json!(1)));
    assert_eq!(provider.total_open_handles(), 0);
}
