//! Integration tests for the reachability tracker

use crate::integration::test_utils::{collector, create_kv, del, engine_over, eventually, put, settle};
use meshstore::store::LocalProvider;
use meshstore::Address;
use serde_json::json;

fn sorted(mut addresses: Vec<Address>) -> Vec<Address> {
    addresses.sort();
    addresses
}

/// R -> {A, B}, A -> C; dropping R's reference to B tears down only B
#[tokio::test]
async fn test_removed_reference_drains_only_that_store() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let c = create_kv(&provider, &[("leaf", json!(true))]).await;
    let a = create_kv(&provider, &[("child", c.to_value())]).await;
    let b = create_kv(&provider, &[]).await;
    let r = create_kv(&provider, &[("a", a.to_value()), ("b", b.to_value())]).await;

    let (cb, seen) = collector::<Vec<Address>>();
    let forget = engine
        .tracker()
        .follow_reachable(r.as_str(), cb)
        .await
        .unwrap();

    let everything = sorted(vec![r.clone(), a.clone(), b.clone(), c.clone()]);
    assert!(eventually(|| seen.lock().last() == Some(&everything)).await);
    assert!(eventually(|| provider.open_handles(&c) == 1).await);
    let opens_a = provider.opens_for(&a);
    let opens_c = provider.opens_for(&c);

    del(&provider, &r, "b").await;
    let remaining = sorted(vec![r.clone(), a.clone(), c.clone()]);
    assert!(eventually(|| seen.lock().last() == Some(&remaining)).await);
    assert!(eventually(|| provider.open_handles(&b) == 0).await);
    assert_eq!(provider.open_handles(&a), 1);
    assert_eq!(provider.open_handles(&c), 1);
    assert_eq!(provider.opens_for(&a), opens_a);
    assert_eq!(provider.opens_for(&c), opens_c);

    forget.forget().await;
    assert_eq!(provider.total_open_handles(), 0);
}

/// Deliveries only happen when the set changes
#[tokio::test]
async fn test_unchanged_set_is_not_redelivered() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let a = create_kv(&provider, &[]).await;
    let r = create_kv(&provider, &[("a", a.to_value())]).await;

    let (cb, seen) = collector::<Vec<Address>>();
    let forget = engine.tracker().follow_reachable(r.as_str(), cb).await.unwrap();
    let both = sorted(vec![r.clone(), a.clone()]);
    assert!(eventually(|| seen.lock().last() == Some(&both)).await);
    settle().await;
    let deliveries = seen.lock().len();

    put(&provider, &r, "title", json!("no new references")).await;
    put(&provider, &a, "note", json!("still nothing")).await;
    settle().await;
    assert_eq!(seen.lock().len(), deliveries);

    forget.forget().await;
}

/// Excluded keys and cycles
#[tokio::test]
async fn test_excluded_keys_and_cycles() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let ancestor = create_kv(&provider, &[]).await;
    let a = create_kv(&provider, &[("copiedFrom", ancestor.to_value())]).await;
    let r = create_kv(&provider, &[("a", a.to_value())]).await;
    put(&provider, &a, "back", r.to_value()).await;

    let (cb, seen) = collector::<Vec<Address>>();
    let forget = engine.tracker().follow_reachable(r.as_str(), cb).await.unwrap();
    let expected = sorted(vec![r.clone(), a.clone()]);
    assert!(eventually(|| seen.lock().last() == Some(&expected)).await);
    settle().await;
    assert_eq!(provider.opens_for(&ancestor), 0);
    assert_eq!(provider.opens_for(&r), 1);

    forget.forget().await;
    assert_eq!(provider.total_open_handles(), 0);
}

/// References inside lists and nested dictionaries are followed
#[tokio::test]
async fn test_nested_references() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let x = create_kv(&provider, &[]).await;
    let y = create_kv(&provider, &[]).await;
    let r = create_kv(
        &provider,
        &[
            ("list", json!([x.to_string()])),
            ("info", json!({"ref": y.to_string()})),
        ],
    )
    .await;

    let (cb, seen) = collector::<Vec<Address>>();
    let forget = engine.tracker().follow_reachable(r.as_str(), cb).await.unwrap();
    let expected = sorted(vec![r.clone(), x, y]);
    assert!(eventually(|| seen.lock().last() == Some(&expected)).await);
    forget.forget().await;
}

/// The heads fingerprint moves when any reachable store changes
#[tokio::test]
async fn test_heads_fingerprint_tracks_nested_writes() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let a = create_kv(&provider, &[("v", json!(1))]).await;
    let r = create_kv(&provider, &[("a", a.to_value())]).await;

    let (cb, seen) = collector::<String>();
    let forget = engine
        .tracker()
        .follow_heads_fingerprint(r.as_str(), cb)
        .await
        .unwrap();
    assert!(eventually(|| !seen.lock().is_empty()).await);
    settle().await;
    let before = seen.lock().last().cloned().unwrap();

    put(&provider, &a, "v", json!(2)).await;
    assert!(eventually(|| seen.lock().last() != Some(&before)).await);

    forget.forget().await;
    assert_eq!(provider.total_open_handles(), 0);
    assert_eq!(engine.active_shared_follows(), 0);
}
