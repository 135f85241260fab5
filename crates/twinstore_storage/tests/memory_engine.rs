//! Integration tests for the in-memory engine.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use twinstore_storage::memory::MemoryRepository;
use twinstore_storage::{
    collect, Context, PropertyKind, Query, Repository, Schema, Storage, Value,
};

fn schema() -> Arc<Schema> {
    Schema::builder("Item")
        .key("id", PropertyKind::Integer)
        .property("label", PropertyKind::Text)
        .build()
        .unwrap()
}

fn snapshot(storage: &Arc<dyn Storage>) -> BTreeMap<i64, Option<String>> {
    collect(storage.query(&Context::new(), &Query::all()).unwrap())
        .unwrap()
        .into_iter()
        .map(|r| {
            (
                r.get("id").and_then(Value::as_integer).unwrap(),
                r.get("label").and_then(Value::as_text).map(str::to_string),
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, String),
    Update(i64, String),
    Delete(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..20, "[a-z]{1,4}").prop_map(|(id, s)| Op::Insert(id, s)),
        (0i64..20, "[a-z]{1,4}").prop_map(|(id, s)| Op::Update(id, s)),
        (0i64..20).prop_map(Op::Delete),
    ]
}

fn apply(storage: &Arc<dyn Storage>, cx: &Context, op: &Op) {
    match op {
        Op::Insert(id, label) => {
            let mut r = storage.prepare().with("id", *id).unwrap().with("label", label.as_str()).unwrap();
            storage.try_insert(cx, &mut r).unwrap();
        }
        Op::Update(id, label) => {
            let mut r = storage.prepare().with("id", *id).unwrap().with("label", label.as_str()).unwrap();
            storage.try_update(cx, &mut r).unwrap();
        }
        Op::Delete(id) => {
            let mut r = storage.prepare().with("id", *id).unwrap();
            storage.try_delete(cx, &mut r).unwrap();
        }
    }
}

proptest! {
    #[test]
    fn rollback_restores_previous_state(
        setup in prop::collection::vec(op(), 0..30),
        work in prop::collection::vec(op(), 0..30),
    ) {
        let repo = MemoryRepository::builder("m").build();
        let storage = repo.storage_for(&schema()).unwrap();
        let root = Context::new();
        for o in &setup {
            apply(&storage, &root, o);
        }
        let before = snapshot(&storage);

        let txn = repo.enter_transaction(&root, None).unwrap();
        let cx = root.with_transaction(Arc::clone(&txn));
        for o in &work {
            apply(&storage, &cx, o);
        }
        txn.exit().unwrap();

        prop_assert_eq!(snapshot(&storage), before);
    }

    #[test]
    fn query_order_matches_key_order(ids in prop::collection::btree_set(-50i64..50, 0..40)) {
        let repo = MemoryRepository::builder("m").build();
        let storage = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();
        for id in ids.iter().rev() {
            let mut r = storage.prepare().with("id", *id).unwrap();
            storage.insert(&cx, &mut r).unwrap();
        }
        let seen: Vec<i64> = snapshot(&storage).into_keys().collect();
        let expected: Vec<i64> = ids.into_iter().collect();
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn concurrent_writers_do_not_lose_rows() {
    let repo = MemoryRepository::builder("m").build();
    let storage = repo.storage_for(&schema()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                let cx = Context::new();
                for i in 0..50 {
                    let mut r = storage.prepare().with("id", t * 1000 + i).unwrap();
                    storage.insert(&cx, &mut r).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(snapshot(&storage).len(), 200);
}

#[test]
fn storage_is_created_once_per_type() {
    let repo = MemoryRepository::builder("m").build();
    let schema = schema();
    let a = repo.memory_storage(&schema).unwrap();
    let b = repo.memory_storage(&schema).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let clash = Schema::builder("Item")
        .key("id", PropertyKind::Text)
        .build()
        .unwrap();
    assert!(repo.storage_for(&clash).is_err());
}
