//! In-memory key-value store for testing.

use crate::backend::KeyValueStore;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory key-value store.
///
/// This store keeps all entries in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral caches that don't need to survive a restart
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use tideline_storage::{InMemoryStore, KeyValueStore};
///
/// let store = InMemoryStore::new();
/// store.set("notes", r#"["a","b"]"#).unwrap();
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory store with pre-existing entries.
    ///
    /// Useful for testing state left behind by an earlier process.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns all stored keys in lexical order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
