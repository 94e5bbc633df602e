//! Property-based tests for replica convergence

use meshstore::store::entry::{sort_for_traversal, Clock, LogEntry, Payload};
use meshstore::store::kv::materialize_key_value;
use meshstore::store::ordered::materialize_ordered;
use meshstore::store::set::materialize_set;
use meshstore::store::{AccessPolicy, LocalProvider, StoreKind, StoreProvider};
use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use serde_json::json;
use std::collections::HashSet;

const KEYS: [&str; 4] = ["fr", "kaq", "hi", "en"];

type Op = (u8, usize, i64);

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec((0u8..4, 0usize..KEYS.len(), -3i64..6), 0..12)
}

fn payload((op, key, n): Op) -> Payload {
    let key = KEYS[key];
    match op {
        0 => Payload::put(key, json!({"value": n, "position": n})),
        1 => Payload::put(key, json!({"value": n})),
        2 => Payload::del(key),
        _ => Payload::move_to(key, n),
    }
}

fn set_payload((op, key, _): Op) -> Payload {
    if op % 2 == 0 {
        Payload::add(json!({"k": KEYS[key]}))
    } else {
        Payload::del_value(json!({"k": KEYS[key]}))
    }
}

/// One writer's chain of entries, each pointing at the previous one
fn chain(writer: &str, ops: &[Op], to_payload: fn(Op) -> Payload) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        let next = entries.last().map(|e| vec![e.hash]).unwrap_or_default();
        let clock = Clock {
            time: i as u64 + 1,
            id: writer.to_string(),
        };
        entries.push(LogEntry::new(clock, next, to_payload(*op)).unwrap());
    }
    entries
}

fn concurrent_logs(to_payload: fn(Op) -> Payload) -> impl Strategy<Value = (Vec<LogEntry>, Vec<LogEntry>)> {
    (ops(), ops()).prop_flat_map(move |(a, b)| {
        let mut entries = chain("alice", &a, to_payload);
        entries.extend(chain("bob", &b, to_payload));
        (Just(entries.clone()), Just(entries).prop_shuffle())
    })
}

fn traversal(mut entries: Vec<LogEntry>) -> Vec<LogEntry> {
    sort_for_traversal(&mut entries);
    entries
}

/// Key-value and ordered views do not depend on arrival order
#[test]
fn test_keyed_views_converge_property() {
    let mut runner = TestRunner::default();

    runner
        .run(&concurrent_logs(payload), |(arrived, reordered)| {
            let left = traversal(arrived);
            let right = traversal(reordered);

            prop_assert_eq!(materialize_key_value(&left), materialize_key_value(&right));
            prop_assert_eq!(materialize_ordered(&left), materialize_ordered(&right));
            Ok(())
        })
        .unwrap();
}

/// Ordered view holds each live key exactly once, the same keys as a plain view
#[test]
fn test_ordered_view_one_entry_per_key_property() {
    let mut runner = TestRunner::default();

    runner
        .run(&concurrent_logs(payload), |(entries, _)| {
            let entries = traversal(entries);
            let ordered = materialize_ordered(&entries);
            let plain = materialize_key_value(&entries);

            let keys: HashSet<&str> = ordered.iter().map(|e| e.key.as_str()).collect();
            prop_assert_eq!(keys.len(), ordered.len());

            let plain_keys: HashSet<&str> = plain.iter().map(|e| e.key.as_str()).collect();
            prop_assert_eq!(keys, plain_keys);
            for entry in &plain {
                let found = ordered.iter().find(|e| e.key == entry.key);
                prop_assert_eq!(found.map(|e| e.hash), Some(entry.hash));
            }
            Ok(())
        })
        .unwrap();
}

/// Sets converge and never hold an element twice
#[test]
fn test_set_view_converges_property() {
    let mut runner = TestRunner::default();

    runner
        .run(&concurrent_logs(set_payload), |(arrived, reordered)| {
            let left = materialize_set(&traversal(arrived));
            let right = materialize_set(&traversal(reordered));
            prop_assert_eq!(&left, &right);

            let distinct: HashSet<String> = left.iter().map(|e| e.value.to_string()).collect();
            prop_assert_eq!(distinct.len(), left.len());
            Ok(())
        })
        .unwrap();
}

/// Two replicas writing concurrently agree once they have exchanged entries
#[test]
fn test_replicas_converge_after_exchange_property() {
    let mut runner = TestRunner::new(Config::with_cases(32));
    let runtime = tokio::runtime::Runtime::new().unwrap();

    runner
        .run(&(ops(), ops(), any::<bool>()), |(a_ops, b_ops, alice_first)| {
            runtime.block_on(async {
                let alice = LocalProvider::new("alice");
                let bob = LocalProvider::new("bob");
                let address = alice
                    .create(StoreKind::KeyValue, AccessPolicy::open())
                    .await
                    .unwrap();
                bob.replicate_from(&alice, &address).unwrap();

                for (provider, ops) in [(&alice, &a_ops), (&bob, &b_ops)] {
                    let store = provider.open(&address).await.unwrap();
                    let kv = store.key_value().unwrap();
                    for &(op, key, n) in ops.iter() {
                        if op == 2 {
                            kv.del(KEYS[key]).await.unwrap();
                        } else {
                            kv.put(KEYS[key], json!(n)).await.unwrap();
                        }
                    }
                    store.close().await;
                }

                if alice_first {
                    alice.replicate_from(&bob, &address).unwrap();
                    bob.replicate_from(&alice, &address).unwrap();
                } else {
                    bob.replicate_from(&alice, &address).unwrap();
                    alice.replicate_from(&bob, &address).unwrap();
                }

                let mut views = Vec::new();
                for provider in [&alice, &bob] {
                    let store = provider.open(&address).await.unwrap();
                    views.push(store.key_value().unwrap().as_map().await.unwrap());
                    store.close().await;
                }
                prop_assert_eq!(&views[0], &views[1]);
                Ok(())
            })
        })
        .unwrap();
}
