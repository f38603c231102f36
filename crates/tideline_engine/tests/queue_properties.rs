//! Property tests: operation queues stay ordered and duplicate-free.

use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;
use tideline_engine::{OperationIndex, QueueKind, RecordKey};
use tideline_storage::{FileStore, InMemoryStore, KeyValueStore};

#[derive(Debug, Clone)]
enum Op {
    Mark(QueueKind, String),
    Clear(QueueKind, String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = prop::sample::select(vec!["1", "2", "12", "a", "b"]);
    let kind = prop::sample::select(vec![QueueKind::Dirty, QueueKind::Destroyed]);
    prop_oneof![
        3 => (kind.clone(), key.clone()).prop_map(|(q, k)| Op::Mark(q, k.to_string())),
        1 => (kind, key).prop_map(|(q, k)| Op::Clear(q, k.to_string())),
    ]
}

/// Reference model: first-insertion order, no duplicates, exact-match removal.
fn apply_model(model: &mut Vec<String>, op: &Op, kind: QueueKind) {
    match op {
        Op::Mark(q, k) if *q == kind => {
            if !model.contains(k) {
                model.push(k.clone());
            }
        }
        Op::Clear(q, k) if *q == kind => model.retain(|m| m != k),
        _ => {}
    }
}

fn apply<S: KeyValueStore>(index: &OperationIndex<S>, op: &Op) {
    match op {
        Op::Mark(QueueKind::Dirty, k) => index.mark_dirty(&RecordKey::new(k.as_str())).unwrap(),
        Op::Mark(QueueKind::Destroyed, k) => {
            index.mark_destroyed(&RecordKey::new(k.as_str())).unwrap()
        }
        Op::Clear(q, k) => {
            index.clear(*q, &RecordKey::new(k.as_str())).unwrap();
        }
    }
}

fn listed<S: KeyValueStore>(index: &OperationIndex<S>, kind: QueueKind) -> Vec<String> {
    index
        .list(kind)
        .unwrap()
        .into_iter()
        .map(|k| k.to_string())
        .collect()
}

proptest! {
    #[test]
    fn queues_match_ordered_set_model(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let backend = Arc::new(InMemoryStore::new());
        let index = OperationIndex::new(Arc::clone(&backend), "/todos");
        let mut dirty = Vec::new();
        let mut destroyed = Vec::new();

        for op in &ops {
            apply(&index, op);
            apply_model(&mut dirty, op, QueueKind::Dirty);
            apply_model(&mut destroyed, op, QueueKind::Destroyed);
        }

        prop_assert_eq!(listed(&index, QueueKind::Dirty), dirty.clone());
        prop_assert_eq!(listed(&index, QueueKind::Destroyed), destroyed.clone());
        prop_assert_eq!(index.has_any().unwrap(), !dirty.is_empty() || !destroyed.is_empty());
        // empty queues leave no persisted marker
        prop_assert_eq!(backend.contains("/todos_dirty").unwrap(), !dirty.is_empty());
    }

    #[test]
    fn repeated_marks_leave_one_entry(key in "[a-z0-9]{1,8}", times in 1usize..20) {
        let index = OperationIndex::new(Arc::new(InMemoryStore::new()), "/todos");
        for _ in 0..times {
            index.mark_dirty(&RecordKey::new(key.as_str())).unwrap();
        }
        prop_assert_eq!(listed(&index, QueueKind::Dirty), vec![key]);
    }

    #[test]
    fn queues_survive_reopen(ops in prop::collection::vec(op_strategy(), 0..20)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let mut dirty = Vec::new();
        {
            let index = OperationIndex::new(Arc::new(FileStore::open(&path).unwrap()), "/todos");
            for op in &ops {
                apply(&index, op);
                apply_model(&mut dirty, op, QueueKind::Dirty);
            }
        }
        let reopened = OperationIndex::new(Arc::new(FileStore::open(&path).unwrap()), "/todos");
        prop_assert_eq!(listed(&reopened, QueueKind::Dirty), dirty);
    }
}
