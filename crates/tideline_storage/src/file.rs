//! File-based key-value store for persistent storage.

use crate::backend::KeyValueStore;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-based key-value store.
///
/// The whole map lives in a single JSON document. Entries are cached in
/// memory and every mutation rewrites the document, so data survives
/// process restarts.
///
/// # Durability
///
/// Each `set` or `remove` writes the document to a sibling temp file,
/// calls `File::sync_all()` on it and renames it over the original. A
/// crash mid-write leaves either the old or the new document, never a torn one.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
/// The write lock is held for the duration of the rewrite.
///
/// # Example
///
/// ```no_run
/// use tideline_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("cache.json")).unwrap();
/// store.set("todos", r#"["1","2"]"#).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens or creates a file store at the given path.
    ///
    /// If the file exists its entries are loaded. If it doesn't exist,
    /// the store starts empty and the file is created on first write.
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not hold a
    /// JSON object of strings.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    StorageError::Corrupted(format!("{}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all stored keys in lexical order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        let body = serde_json::to_vec_pretty(entries)?;
        let temp = self.temp_path();

        let mut file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.write();
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            // keep the cache in step with what is on disk
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.entries.write();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_open_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(&dir.path().join("cache.json")).unwrap();
        assert!(store.keys().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn file_set_creates_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let store = FileStore::open(&path).unwrap();

        store.set("todos/1", r#"{"id":1}"#).unwrap();
        assert!(path.exists());
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn file_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("a", "1").unwrap();
            store.set("b", "2").unwrap();
            store.remove("a").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn file_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("cache.json");
        let store = FileStore::open(&path).unwrap();
        store.set("k", "v").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json").unwrap();

        let result = FileStore::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_empty_document_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn file_remove_absent_does_not_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let store = FileStore::open(&path).unwrap();
        store.remove("missing").unwrap();
        assert!(!path.exists());
    }
}
