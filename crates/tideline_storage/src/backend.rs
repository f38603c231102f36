//! Key-value store trait definition.

use crate::error::StorageResult;
use std::sync::Arc;

/// A persisted key-value store.
///
/// Stores are **opaque string maps**. Callers flatten whatever they persist
/// (records, id lists, journals) into strings before handing them over.
///
/// # Invariants
///
/// - `get` returns exactly the value last passed to `set` for that key
/// - `set` and `remove` are durable once they return
/// - Removing an absent key is not an error
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be made durable.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes `key` from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be made durable.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Returns true if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        (**self).remove(key)
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        (**self).contains(key)
    }
}
