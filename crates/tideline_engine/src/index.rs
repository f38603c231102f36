//! Persisted ordered id sets and the per-namespace operation index.

use crate::error::SyncResult;
use crate::lock::StoreLock;
use crate::record::RecordKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tideline_storage::KeyValueStore;

/// An ordered, deduplicated set of record keys.
///
/// # Invariants
///
/// - A key appears at most once
/// - Keys keep the order of their first insertion
/// - Removal is exact-match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdSet {
    keys: Vec<RecordKey>,
}

impl IdSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the set persisted under `key`. A missing key is an empty set.
    pub fn load<S: KeyValueStore + ?Sized>(backend: &S, key: &str) -> SyncResult<Self> {
        let mut set = match backend.get(key)? {
            Some(raw) => serde_json::from_str::<IdSet>(&raw)?,
            None => IdSet::new(),
        };
        // tolerate duplicates written by older builds
        set.dedup();
        Ok(set)
    }

    /// Persists the set under `key`, removing the key when the set is empty.
    pub fn persist<S: KeyValueStore + ?Sized>(&self, backend: &S, key: &str) -> SyncResult<()> {
        if self.keys.is_empty() {
            backend.remove(key)?;
        } else {
            backend.set(key, &serde_json::to_string(self)?)?;
        }
        Ok(())
    }

    /// Appends `key` unless it is already present. Returns true if added.
    pub fn insert(&mut self, key: RecordKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    /// Removes `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &RecordKey) -> bool {
        match self.keys.iter().position(|k| k == key) {
            Some(pos) => {
                self.keys.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.keys.contains(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates over the keys in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RecordKey> {
        self.keys.iter()
    }

    /// Consumes the set, returning its keys in insertion order.
    pub fn into_vec(self) -> Vec<RecordKey> {
        self.keys
    }

    fn dedup(&mut self) {
        let mut seen = Vec::with_capacity(self.keys.len());
        self.keys.retain(|k| {
            if seen.contains(k) {
                false
            } else {
                seen.push(k.clone());
                true
            }
        });
    }
}

/// Which pending-operation queue an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Needs a remote create or update.
    Dirty,
    /// Needs a remote delete.
    Destroyed,
}

impl QueueKind {
    /// Suffix appended to the namespace to form the persisted key.
    pub fn suffix(&self) -> &'static str {
        match self {
            QueueKind::Dirty => "_dirty",
            QueueKind::Destroyed => "_destroyed",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Dirty => f.write_str("dirty"),
            QueueKind::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// The dirty and destroyed queues of one namespace.
///
/// Every mutation is persisted before it returns.
pub struct OperationIndex<S: KeyValueStore> {
    backend: Arc<S>,
    namespace: String,
    lock: StoreLock,
}

impl<S: KeyValueStore> OperationIndex<S> {
    /// Opens the index of `namespace`.
    pub fn new(backend: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            lock: StoreLock::new(),
        }
    }

    /// Shares `lock` with the other stores over the same backend.
    pub fn with_lock(mut self, lock: StoreLock) -> Self {
        self.lock = lock;
        self
    }

    fn storage_key(&self, kind: QueueKind) -> String {
        format!("{}{}", self.namespace, kind.suffix())
    }

    fn mark(&self, kind: QueueKind, key: &RecordKey) -> SyncResult<()> {
        let storage_key = self.storage_key(kind);
        let _held = self.lock.acquire();
        let mut set = IdSet::load(self.backend.as_ref(), &storage_key)?;
        if set.insert(key.clone()) {
            set.persist(self.backend.as_ref(), &storage_key)?;
        }
        Ok(())
    }

    /// Queues `key` for a remote create or update.
    pub fn mark_dirty(&self, key: &RecordKey) -> SyncResult<()> {
        self.mark(QueueKind::Dirty, key)
    }

    /// Queues `key` for a remote delete.
    pub fn mark_destroyed(&self, key: &RecordKey) -> SyncResult<()> {
        self.mark(QueueKind::Destroyed, key)
    }

    /// Removes `key` from one queue. Returns true if it was queued.
    pub fn clear(&self, kind: QueueKind, key: &RecordKey) -> SyncResult<bool> {
        let storage_key = self.storage_key(kind);
        let _held = self.lock.acquire();
        let mut set = IdSet::load(self.backend.as_ref(), &storage_key)?;
        if !set.remove(key) {
            return Ok(false);
        }
        set.persist(self.backend.as_ref(), &storage_key)?;
        Ok(true)
    }

    /// Returns true if `key` is in the given queue.
    pub fn contains(&self, kind: QueueKind, key: &RecordKey) -> SyncResult<bool> {
        Ok(IdSet::load(self.backend.as_ref(), &self.storage_key(kind))?.contains(key))
    }

    /// Pending keys of one queue, in insertion order.
    pub fn list(&self, kind: QueueKind) -> SyncResult<Vec<RecordKey>> {
        Ok(IdSet::load(self.backend.as_ref(), &self.storage_key(kind))?.into_vec())
    }

    /// Returns true if the dirty queue is non-empty.
    pub fn has_dirty(&self) -> SyncResult<bool> {
        Ok(self.backend.contains(&self.storage_key(QueueKind::Dirty))?)
    }

    /// Returns true if either queue is non-empty.
    pub fn has_any(&self) -> SyncResult<bool> {
        Ok(self.backend.contains(&self.storage_key(QueueKind::Dirty))?
            || self.backend.contains(&self.storage_key(QueueKind::Destroyed))?)
    }
}
