//! Append-only journal of server rejections.

use crate::error::SyncResult;
use crate::index::QueueKind;
use crate::lock::StoreLock;
use crate::record::RecordKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tideline_storage::KeyValueStore;

/// One rejected submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Namespace of the record.
    pub namespace: String,
    /// Queue the id was purged from, if the failure came from a queued write.
    pub queue: Option<QueueKind>,
    /// Record key, when known.
    pub key: Option<RecordKey>,
    /// Transport status.
    pub status: u16,
    /// Raw failure payload.
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

impl JournalEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(namespace: impl Into<String>, status: u16, payload: Value) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            namespace: namespace.into(),
            queue: None,
            key: None,
            status,
            payload,
            recorded_at,
        }
    }

    /// Attaches the queue and record key.
    pub fn with_record(mut self, queue: QueueKind, key: RecordKey) -> Self {
        self.queue = Some(queue);
        self.key = Some(key);
        self
    }
}

/// Persisted, append-only list of [`JournalEntry`] values.
///
/// Kept for offline debugging; the engine only ever appends to it.
pub struct ErrorJournal<S: KeyValueStore> {
    backend: Arc<S>,
    key: String,
    lock: StoreLock,
}

impl<S: KeyValueStore> ErrorJournal<S> {
    /// Opens the journal stored under `key`.
    pub fn new(backend: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            lock: StoreLock::new(),
        }
    }

    /// Shares `lock` with the other stores over the same backend.
    pub fn with_lock(mut self, lock: StoreLock) -> Self {
        self.lock = lock;
        self
    }

    /// Persisted key of the journal.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends an entry.
    pub fn append(&self, entry: JournalEntry) -> SyncResult<()> {
        let _held = self.lock.acquire();
        let mut entries = self.entries()?;
        entries.push(entry);
        self.backend
            .set(&self.key, &serde_json::to_string(&entries)?)?;
        Ok(())
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> SyncResult<Vec<JournalEntry>> {
        match self.backend.get(&self.key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.entries()?.len())
    }

    /// Returns true if nothing was journaled.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(!self.backend.contains(&self.key)?)
    }

    /// Drops every entry.
    pub fn clear(&self) -> SyncResult<()> {
        let _held = self.lock.acquire();
        self.backend.remove(&self.key)?;
        Ok(())
    }
}
