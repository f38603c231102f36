//! Persisted record store for one namespace.

use crate::error::{SyncError, SyncResult};
use crate::index::IdSet;
use crate::lock::StoreLock;
use crate::record::{Record, RecordKey};
use std::sync::Arc;
use tideline_storage::KeyValueStore;

/// Separator between the namespace and a record id in persisted keys.
const SEPARATOR: char = '/';

/// CRUD over the records of one namespace and its record-id index.
///
/// # Layout
///
/// - `namespace` holds the record index (ordered ids)
/// - `namespace/id` holds one record as a JSON object
///
/// The index is re-read on every call, so several stores opened over the
/// same backend always agree. Every mutation is persisted before it returns.
pub struct RecordStore<S: KeyValueStore> {
    backend: Arc<S>,
    namespace: String,
    id_attribute: String,
    lock: StoreLock,
}

impl<S: KeyValueStore> RecordStore<S> {
    /// Opens the store of `namespace`.
    pub fn new(backend: Arc<S>, namespace: impl Into<String>, id_attribute: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            id_attribute: id_attribute.into(),
            lock: StoreLock::new(),
        }
    }

    /// Shares `lock` with the other stores over the same backend.
    pub fn with_lock(mut self, lock: StoreLock) -> Self {
        self.lock = lock;
        self
    }

    /// Returns the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn record_key(&self, key: &RecordKey) -> String {
        format!("{}{}{}", self.namespace, SEPARATOR, key)
    }

    fn index(&self) -> SyncResult<IdSet> {
        IdSet::load(self.backend.as_ref(), &self.namespace)
    }

    fn write(&self, key: &RecordKey, record: &Record) -> SyncResult<()> {
        let _held = self.lock.acquire();
        self.backend
            .set(&self.record_key(key), &serde_json::to_string(record)?)?;
        let mut index = self.index()?;
        if index.insert(key.clone()) {
            index.persist(self.backend.as_ref(), &self.namespace)?;
        }
        Ok(())
    }

    /// Stores a new record, assigning a temporary key if it has none.
    pub fn create(&self, mut record: Record) -> SyncResult<Record> {
        let key = match record.key(&self.id_attribute) {
            Some(key) => key,
            None => {
                let key = RecordKey::generate();
                record.set_key(&self.id_attribute, &key);
                key
            }
        };
        self.write(&key, &record)?;
        Ok(record)
    }

    /// Stores an existing record under its identity.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingIdentity`] if the record has no key.
    pub fn update(&self, record: &Record) -> SyncResult<Record> {
        let key = record
            .key(&self.id_attribute)
            .ok_or_else(|| SyncError::MissingIdentity(self.id_attribute.clone()))?;
        self.write(&key, record)?;
        Ok(record.clone())
    }

    /// Returns the record stored under `key`, if any.
    pub fn find(&self, key: &RecordKey) -> SyncResult<Option<Record>> {
        match self.backend.get(&self.record_key(key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Returns every record in index order. Ids whose payload is missing are skipped.
    pub fn find_all(&self) -> SyncResult<Vec<Record>> {
        let mut records = Vec::new();
        for key in self.index()?.iter() {
            if let Some(record) = self.find(key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Removes a record. A record without identity is returned untouched.
    pub fn destroy(&self, record: &Record) -> SyncResult<Record> {
        if let Some(key) = record.key(&self.id_attribute) {
            self.destroy_key(&key)?;
        }
        Ok(record.clone())
    }

    /// Removes the record stored under `key`. Returns true if it was indexed.
    pub fn destroy_key(&self, key: &RecordKey) -> SyncResult<bool> {
        let _held = self.lock.acquire();
        self.backend.remove(&self.record_key(key))?;
        let mut index = self.index()?;
        if !index.remove(key) {
            return Ok(false);
        }
        index.persist(self.backend.as_ref(), &self.namespace)?;
        Ok(true)
    }

    /// Removes every record of the namespace and empties the index.
    pub fn clear(&self) -> SyncResult<()> {
        let _held = self.lock.acquire();
        let index = self.index()?;
        for key in index.iter() {
            self.backend.remove(&self.record_key(key))?;
        }
        IdSet::new().persist(self.backend.as_ref(), &self.namespace)
    }

    /// Number of indexed records.
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.index()?.len())
    }

    /// Returns true if no record is indexed.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.index()?.is_empty())
    }

    /// Indexed keys in order.
    pub fn keys(&self) -> SyncResult<Vec<RecordKey>> {
        Ok(self.index()?.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideline_storage::InMemoryStore;

    fn store() -> (Arc<InMemoryStore>, RecordStore<InMemoryStore>) {
        let backend = Arc::new(InMemoryStore::new());
        let store = RecordStore::new(Arc::clone(&backend), "/todos", "id");
        (backend, store)
    }

    #[test]
    fn create_assigns_temporary_key() {
        let (backend, store) = store();
        let created = store.create(Record::new().with("title", "milk")).unwrap();

        let key = created.key("id").unwrap();
        assert!(key.is_temporary());
        assert!(backend.contains(&format!("/todos/{key}")).unwrap());
        assert_eq!(store.keys().unwrap(), vec![key]);
    }

    #[test]
    fn create_keeps_existing_key() {
        let (_, store) = store();
        let created = store.create(Record::new().with("id", 5)).unwrap();
        assert_eq!(created.key("id"), Some(RecordKey::new("5")));
        assert!(store.find(&RecordKey::new("5")).unwrap().is_some());
    }

    #[test]
    fn create_twice_does_not_duplicate_index() {
        let (_, store) = store();
        store.create(Record::new().with("id", "a")).unwrap();
        store.create(Record::new().with("id", "a")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn update_requires_identity() {
        let (_, store) = store();
        let result = store.update(&Record::new().with("title", "x"));
        assert!(matches!(result, Err(SyncError::MissingIdentity(_))));
    }

    #[test]
    fn update_adds_to_index_when_absent() {
        let (_, store) = store();
        store.update(&Record::new().with("id", "9").with("n", 1)).unwrap();
        store.update(&Record::new().with("id", "9").with("n", 2)).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        let found = store.find(&RecordKey::new("9")).unwrap().unwrap();
        assert_eq!(found.get("n"), Some(&json!(2)));
    }

    #[test]
    fn find_missing_is_none() {
        let (_, store) = store();
        assert!(store.find(&RecordKey::new("nope")).unwrap().is_none());
    }

    #[test]
    fn find_all_in_index_order() {
        let (_, store) = store();
        for id in ["3", "1", "2"] {
            store.create(Record::new().with("id", id)).unwrap();
        }
        let ids: Vec<_> = store
            .find_all()
            .unwrap()
            .iter()
            .map(|r| r.key("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
    }

    #[test]
    fn destroy_without_identity_is_noop() {
        let (_, store) = store();
        store.create(Record::new().with("id", "1")).unwrap();
        let returned = store.destroy(&Record::new().with("title", "x")).unwrap();
        assert_eq!(returned.get("title"), Some(&json!("x")));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn destroy_removes_payload_and_index_entry() {
        let (backend, store) = store();
        let created = store.create(Record::new().with("id", "1")).unwrap();
        store.destroy(&created).unwrap();

        assert!(store.is_empty().unwrap());
        assert!(!backend.contains("/todos/1").unwrap());
        assert!(!backend.contains("/todos").unwrap());
    }

    #[test]
    fn clear_removes_everything() {
        let (backend, store) = store();
        for id in ["1", "2"] {
            store.create(Record::new().with("id", id)).unwrap();
        }
        store.clear().unwrap();
        assert!(backend.is_empty());
        assert!(store.find_all().unwrap().is_empty());
    }

    #[test]
    fn custom_id_attribute() {
        let backend = Arc::new(InMemoryStore::new());
        let store = RecordStore::new(backend, "/people", "_id");
        let created = store.create(Record::new().with("name", "ada")).unwrap();
        assert!(created.key("_id").unwrap().is_temporary());
        assert_eq!(created.key("id"), None);
    }
}
