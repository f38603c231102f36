//! Temporary-to-permanent key remapping.

use crate::record::RecordKey;
use std::collections::HashMap;

/// What the table knows about a temporary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemapEntry {
    /// A remote create is in flight. Holds the namespace it was issued for.
    Provisional(String),
    /// The server assigned this permanent key.
    Permanent(RecordKey),
}

impl RemapEntry {
    /// Returns the permanent key, if assigned.
    pub fn permanent(&self) -> Option<&RecordKey> {
        match self {
            RemapEntry::Permanent(key) => Some(key),
            RemapEntry::Provisional(_) => None,
        }
    }
}

/// Mapping from temporary keys to server-assigned keys.
///
/// Scoped to one sync session: it is reset when a session goes from idle to
/// active and is left untouched while a session continues work added
/// mid-flight.
#[derive(Debug, Default)]
pub struct KeyRemapTable {
    entries: HashMap<RecordKey, RemapEntry>,
}

impl KeyRemapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the permanent key of `temporary`.
    pub fn put(&mut self, temporary: RecordKey, permanent: RecordKey) {
        self.entries
            .insert(temporary, RemapEntry::Permanent(permanent));
    }

    /// Installs a placeholder while the remote create of `temporary` is in
    /// flight. Returns false if the key already has an entry.
    pub fn put_provisional(&mut self, temporary: RecordKey, namespace: &str) -> bool {
        if self.entries.contains_key(&temporary) {
            return false;
        }
        self.entries
            .insert(temporary, RemapEntry::Provisional(namespace.to_string()));
        true
    }

    /// Returns the entry of `temporary`.
    pub fn get(&self, temporary: &RecordKey) -> Option<&RemapEntry> {
        self.entries.get(temporary)
    }

    /// Returns the permanent key of `temporary`, if assigned.
    pub fn resolve(&self, temporary: &RecordKey) -> Option<RecordKey> {
        self.entries
            .get(temporary)
            .and_then(RemapEntry::permanent)
            .cloned()
    }

    /// Drops a provisional entry whose create did not go through.
    /// Permanent entries are kept.
    pub fn forget(&mut self, temporary: &RecordKey) {
        if matches!(self.entries.get(temporary), Some(RemapEntry::Provisional(_))) {
            self.entries.remove(temporary);
        }
    }

    /// Every assigned (temporary, permanent) pair.
    pub fn permanent_entries(&self) -> Vec<(RecordKey, RecordKey)> {
        self.entries
            .iter()
            .filter_map(|(temp, entry)| entry.permanent().map(|p| (temp.clone(), p.clone())))
            .collect()
    }

    /// Removes every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_then_permanent() {
        let mut table = KeyRemapTable::new();
        let temp = RecordKey::generate();

        assert!(table.put_provisional(temp.clone(), "/todos"));
        assert!(!table.put_provisional(temp.clone(), "/todos"));
        assert_eq!(table.resolve(&temp), None);

        table.put(temp.clone(), RecordKey::new("42"));
        assert_eq!(table.resolve(&temp), Some(RecordKey::new("42")));
        assert_eq!(
            table.permanent_entries(),
            vec![(temp, RecordKey::new("42"))]
        );
    }

    #[test]
    fn forget_keeps_permanent_entries() {
        let mut table = KeyRemapTable::new();
        let pending = RecordKey::generate();
        let done = RecordKey::generate();
        table.put_provisional(pending.clone(), "/todos");
        table.put(done.clone(), RecordKey::new("1"));

        table.forget(&pending);
        table.forget(&done);

        assert!(table.get(&pending).is_none());
        assert_eq!(table.resolve(&done), Some(RecordKey::new("1")));
    }

    #[test]
    fn reset_clears() {
        let mut table = KeyRemapTable::new();
        table.put(RecordKey::generate(), RecordKey::new("1"));
        table.reset();
        assert!(table.is_empty());
    }
}
