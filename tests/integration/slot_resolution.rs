//! Integration tests for slot resolution and dictionary copies

use crate::integration::test_utils::{create_kv, dict, engine_over, put};
use meshstore::store::{LocalProvider, StoreKind, StoreProvider};
use meshstore::{EngineError, StoreError};
use serde_json::json;

/// A remembered child that lost the race is folded into the canonical one
#[tokio::test]
async fn test_stale_slot_is_folded_and_deleted() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let parent = create_kv(&provider, &[]).await;

    let stale = engine
        .merger()
        .resolve_slot(parent.as_str(), "settings", Some(StoreKind::KeyValue))
        .await
        .unwrap()
        .unwrap();
    put(&provider, &stale, "theme", json!("dark")).await;
    put(&provider, &stale, "lang", json!("fr")).await;

    // Another replica's child won the key.
    let canonical = create_kv(&provider, &[("lang", json!("kaq"))]).await;
    put(&provider, &parent, "settings", canonical.to_value()).await;

    let resolved = engine
        .merger()
        .resolve_slot(parent.as_str(), "settings", Some(StoreKind::KeyValue))
        .await
        .unwrap();
    assert_eq!(resolved, Some(canonical.clone()));

    let merged = dict(&provider, &canonical).await;
    assert_eq!(merged.get("theme"), Some(&json!("dark")));
    assert_eq!(merged.get("lang"), Some(&json!("kaq")));

    let err = provider.open(&stale).await.unwrap_err();
    assert!(matches!(err, StoreError::OpenFailed { .. }));
    assert_eq!(provider.total_open_handles(), 0);

    let again = engine
        .merger()
        .resolve_slot(parent.as_str(), "settings", Some(StoreKind::KeyValue))
        .await
        .unwrap();
    assert_eq!(again, Some(canonical));
}

/// An existing child of another variant is reported, not replaced
#[tokio::test]
async fn test_slot_of_wrong_kind_is_rejected() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let parent = create_kv(&provider, &[]).await;
    engine
        .merger()
        .resolve_slot(parent.as_str(), "members", Some(StoreKind::Set))
        .await
        .unwrap();

    let err = engine
        .merger()
        .resolve_slot(parent.as_str(), "members", Some(StoreKind::Feed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::TypeMismatch { .. })));
    assert_eq!(provider.total_open_handles(), 0);
}

/// Pairs of the base dictionary land in the new parent's dictionary
#[tokio::test]
async fn test_copy_dict_content() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let source = create_kv(&provider, &[("a", json!(1)), ("b", json!("two"))]).await;
    let target = create_kv(&provider, &[("b", json!("old")), ("c", json!(3))]).await;
    let base_parent = create_kv(&provider, &[("meta", source.to_value())]).await;
    let new_parent = create_kv(&provider, &[("meta", target.to_value())]).await;

    let copied = engine
        .merger()
        .copy_dict_content(base_parent.as_str(), new_parent.as_str(), "meta")
        .await
        .unwrap();
    assert_eq!(copied, 2);

    let result = dict(&provider, &target).await;
    assert_eq!(result.get("a"), Some(&json!(1)));
    assert_eq!(result.get("b"), Some(&json!("two")));
    assert_eq!(result.get("c"), Some(&json!(3)));
    assert_eq!(provider.total_open_handles(), 0);
}

/// Nothing to copy is fine; nowhere to copy to is an error
#[tokio::test]
async fn test_copy_dict_content_missing_sides() {
    let provider = LocalProvider::new("alice");
    let engine = engine_over(&provider);
    let source = create_kv(&provider, &[("a", json!(1))]).await;
    let empty_parent = create_kv(&provider, &[]).await;
    let base_parent = create_kv(&provider, &[("meta", source.to_value())]).await;

    let copied = engine
        .merger()
        .copy_dict_content(empty_parent.as_str(), base_parent.as_str(), "meta")
        .await
        .unwrap();
    assert_eq!(copied, 0);

    let err = engine
        .merger()
        .copy_dict_content(base_parent.as_str(), empty_parent.as_str(), "meta")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidElement(_)));
    assert_eq!(provider.total_open_handles(), 0);
}
