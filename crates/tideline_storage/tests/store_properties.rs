//! Property tests: both stores behave like a plain map.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;
use tideline_storage::{FileStore, InMemoryStore, KeyValueStore};

#[derive(Debug, Clone)]
enum Op {
    Set(String, String),
    Remove(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = prop::sample::select(vec!["todos", "todos/1", "todos_dirty", "notes/a"]);
    prop_oneof![
        (key.clone(), "[a-z0-9,]{0,12}").prop_map(|(k, v)| Op::Set(k.to_string(), v)),
        key.prop_map(|k| Op::Remove(k.to_string())),
    ]
}

fn apply(store: &dyn KeyValueStore, model: &mut BTreeMap<String, String>, op: &Op) {
    match op {
        Op::Set(k, v) => {
            store.set(k, v).unwrap();
            model.insert(k.clone(), v.clone());
        }
        Op::Remove(k) => {
            store.remove(k).unwrap();
            model.remove(k);
        }
    }
}

proptest! {
    #[test]
    fn memory_store_matches_map(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let store = InMemoryStore::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&store, &mut model, op);
        }
        for (k, v) in &model {
            let got = store.get(k).unwrap();
            prop_assert_eq!(got.as_ref(), Some(v));
        }
        prop_assert_eq!(store.len(), model.len());
    }

    #[test]
    fn file_store_matches_map_after_reopen(ops in prop::collection::vec(op_strategy(), 0..20)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let mut model = BTreeMap::new();
        {
            let store = FileStore::open(&path).unwrap();
            for op in &ops {
                apply(&store, &mut model, op);
            }
        }
        let reopened = FileStore::open(&path).unwrap();
        prop_assert_eq!(reopened.keys(), model.keys().cloned().collect::<Vec<_>>());
        for (k, v) in &model {
            let got = reopened.get(k).unwrap();
            prop_assert_eq!(got.as_ref(), Some(v));
        }
    }
}
