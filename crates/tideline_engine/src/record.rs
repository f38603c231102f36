//! Records, record keys and read targets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Length of a temporary key rendered as 8-4-4-4-12.
const TEMPORARY_KEY_LEN: usize = 36;
/// Number of `-` separators in a temporary key.
const TEMPORARY_KEY_SEPARATORS: usize = 4;

/// The identity of a record.
///
/// A key is either *temporary* (generated locally, 36 characters with exactly
/// four `-` separators) or *permanent* (assigned by the remote store, anything
/// else). Numeric server ids are kept as their decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Creates a key from its text form.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generates a fresh temporary key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    /// Reads a key from an attribute value. Strings and numbers qualify;
    /// empty strings and everything else do not.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Returns true if this key was generated locally.
    pub fn is_temporary(&self) -> bool {
        self.0.len() == TEMPORARY_KEY_LEN
            && self.0.matches('-').count() == TEMPORARY_KEY_SEPARATORS
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// An opaque attribute set with one identity attribute.
///
/// Which attribute carries the identity is decided by the collection the
/// record belongs to, so every identity accessor takes its name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    attributes: Map<String, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object. Returns `None` for any other JSON value.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(attributes) => Some(Self { attributes }),
            _ => None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns an attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Sets an attribute.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Removes an attribute.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Returns the record identity, if set.
    pub fn key(&self, id_attribute: &str) -> Option<RecordKey> {
        self.attributes.get(id_attribute).and_then(RecordKey::from_value)
    }

    /// Sets the record identity.
    pub fn set_key(&mut self, id_attribute: &str, key: &RecordKey) {
        self.attributes
            .insert(id_attribute.to_string(), Value::String(key.as_str().to_string()));
    }

    /// Clears the record identity so a remote save performs a create.
    pub fn clear_key(&mut self, id_attribute: &str) {
        self.attributes.remove(id_attribute);
    }

    /// Copies every attribute of `other` over this record.
    pub fn merge(&mut self, other: &Record) {
        for (name, value) in &other.attributes {
            self.attributes.insert(name.clone(), value.clone());
        }
    }

    /// Returns the attributes.
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Converts the record into a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.attributes)
    }
}

/// The result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// A single record.
    Record(Record),
    /// A collection of records, in store or server order.
    Records(Vec<Record>),
    /// The single record asked for does not exist.
    NotFound,
}

impl Snapshot {
    /// Builds a snapshot from a remote response body.
    ///
    /// Arrays become [`Snapshot::Records`] (non-object items are skipped),
    /// objects become [`Snapshot::Record`], anything else is [`Snapshot::NotFound`].
    pub fn from_response(body: Value) -> Self {
        match body {
            Value::Array(items) => {
                Snapshot::Records(items.into_iter().filter_map(Record::from_value).collect())
            }
            Value::Object(attributes) => Snapshot::Record(Record { attributes }),
            _ => Snapshot::NotFound,
        }
    }

    /// Returns true if the snapshot holds no record.
    pub fn is_empty(&self) -> bool {
        match self {
            Snapshot::Record(_) => false,
            Snapshot::Records(records) => records.is_empty(),
            Snapshot::NotFound => true,
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        match self {
            Snapshot::Record(_) => 1,
            Snapshot::Records(records) => records.len(),
            Snapshot::NotFound => 0,
        }
    }

    /// Flattens the snapshot into a list of records.
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Snapshot::Record(record) => vec![record],
            Snapshot::Records(records) => records,
            Snapshot::NotFound => Vec::new(),
        }
    }
}

/// Something a read can address and refresh: a single record or a
/// collection of records held in memory by the application.
pub trait Target {
    /// Key of the single record addressed, or `None` for a whole collection.
    fn key(&self, id_attribute: &str) -> Option<RecordKey>;

    /// Replaces the in-memory state with a read result.
    fn absorb(&mut self, id_attribute: &str, snapshot: Snapshot);

    /// Swaps a temporary key for the permanent key the server assigned.
    fn rekey(&mut self, id_attribute: &str, temporary: &RecordKey, permanent: &RecordKey);
}

impl Target for Record {
    fn key(&self, id_attribute: &str) -> Option<RecordKey> {
        Record::key(self, id_attribute)
    }

    fn absorb(&mut self, _id_attribute: &str, snapshot: Snapshot) {
        if let Snapshot::Record(fresh) = snapshot {
            *self = fresh;
        }
    }

    fn rekey(&mut self, id_attribute: &str, temporary: &RecordKey, permanent: &RecordKey) {
        if Record::key(self, id_attribute).as_ref() == Some(temporary) {
            self.set_key(id_attribute, permanent);
        }
    }
}

/// An in-memory collection of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from records.
    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Returns the record with the given key.
    pub fn get(&self, id_attribute: &str, key: &RecordKey) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| r.key(id_attribute).as_ref() == Some(key))
    }

    /// Inserts a record or replaces the one with the same key.
    pub fn upsert(&mut self, id_attribute: &str, record: Record) {
        let key = record.key(id_attribute);
        match key.and_then(|k| {
            self.records
                .iter()
                .position(|r| r.key(id_attribute).as_ref() == Some(&k))
        }) {
            Some(pos) => self.records[pos] = record,
            None => self.records.push(record),
        }
    }

    /// Removes the record with the given key.
    pub fn remove(&mut self, id_attribute: &str, key: &RecordKey) -> Option<Record> {
        let pos = self
            .records
            .iter()
            .position(|r| r.key(id_attribute).as_ref() == Some(key))?;
        Some(self.records.remove(pos))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the records.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
}

impl Target for RecordSet {
    fn key(&self, _id_attribute: &str) -> Option<RecordKey> {
        None
    }

    fn absorb(&mut self, id_attribute: &str, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Records(records) => self.records = records,
            Snapshot::Record(record) => self.upsert(id_attribute, record),
            Snapshot::NotFound => {}
        }
    }

    fn rekey(&mut self, id_attribute: &str, temporary: &RecordKey, permanent: &RecordKey) {
        // a permanent copy may already be present after a refresh; keep only one
        if self.get(id_attribute, permanent).is_some() {
            self.remove(id_attribute, temporary);
            return;
        }
        for record in &mut self.records {
            Target::rekey(record, id_attribute, temporary, permanent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_keys_are_temporary() {
        let key = RecordKey::generate();
        assert_eq!(key.as_str().len(), 36);
        assert!(key.is_temporary());
        assert_ne!(key, RecordKey::generate());
    }

    #[test]
    fn server_keys_are_permanent() {
        assert!(!RecordKey::new("42").is_temporary());
        assert!(!RecordKey::new("a-b-c-d-e").is_temporary());
        // right length, wrong separator count
        assert!(!RecordKey::new("0123456789abcdef0123456789abcdef-123").is_temporary());
    }

    #[test]
    fn key_from_value() {
        assert_eq!(RecordKey::from_value(&json!(7)), Some(RecordKey::new("7")));
        assert_eq!(RecordKey::from_value(&json!("x")), Some(RecordKey::new("x")));
        assert_eq!(RecordKey::from_value(&json!("")), None);
        assert_eq!(RecordKey::from_value(&json!(null)), None);
    }

    #[test]
    fn record_identity() {
        let mut record = Record::new().with("title", "milk");
        assert_eq!(record.key("id"), None);

        record.set_key("id", &RecordKey::new("12"));
        assert_eq!(record.key("id"), Some(RecordKey::new("12")));

        record.clear_key("id");
        assert_eq!(record.key("id"), None);
        assert_eq!(record.get("title"), Some(&json!("milk")));
    }

    #[test]
    fn record_merge_prefers_incoming() {
        let mut local = Record::new().with("title", "old").with("done", false);
        let remote = Record::new().with("title", "new").with("id", 3);
        local.merge(&remote);

        assert_eq!(local.get("title"), Some(&json!("new")));
        assert_eq!(local.get("done"), Some(&json!(false)));
        assert_eq!(local.key("id"), Some(RecordKey::new("3")));
    }

    #[test]
    fn snapshot_from_response() {
        let snap = Snapshot::from_response(json!([{"id": 1}, 5, {"id": 2}]));
        assert_eq!(snap.len(), 2);

        let snap = Snapshot::from_response(json!({"id": 1}));
        assert!(matches!(snap, Snapshot::Record(_)));

        assert!(Snapshot::from_response(Value::Null).is_empty());
    }

    #[test]
    fn record_set_rekey_swaps_temporary_key() {
        let temp = RecordKey::generate();
        let mut set = RecordSet::new();
        let mut record = Record::new().with("title", "a");
        record.set_key("id", &temp);
        set.upsert("id", record);

        set.rekey("id", &temp, &RecordKey::new("9"));
        assert!(set.get("id", &temp).is_none());
        assert!(set.get("id", &RecordKey::new("9")).is_some());
    }

    #[test]
    fn record_set_rekey_drops_duplicate() {
        let temp = RecordKey::generate();
        let mut set = RecordSet::new();
        let mut pending = Record::new();
        pending.set_key("id", &temp);
        set.upsert("id", pending);
        set.upsert("id", Record::new().with("id", "9"));

        set.rekey("id", &temp, &RecordKey::new("9"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn record_set_absorb() {
        let mut set = RecordSet::new();
        set.absorb("id", Snapshot::Records(vec![Record::new().with("id", 1)]));
        assert_eq!(set.len(), 1);

        set.absorb("id", Snapshot::Record(Record::new().with("id", 1).with("x", 2)));
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get("id", &RecordKey::new("1")).unwrap().get("x"),
            Some(&json!(2))
        );
    }
}
