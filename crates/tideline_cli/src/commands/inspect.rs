//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tideline_engine::{OperationIndex, QueueKind, RecordKey, RecordStore};
use tideline_storage::KeyValueStore;

/// Namespace inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Cache file path.
    pub path: String,
    /// Inspected namespace.
    pub namespace: String,
    /// Number of indexed records.
    pub record_count: usize,
    /// Indexed records still under a temporary key.
    pub temporary_count: usize,
    /// Indexed keys in order.
    pub keys: Vec<String>,
    /// Keys waiting for a remote create or update.
    pub dirty: Vec<String>,
    /// Keys waiting for a remote delete.
    pub destroyed: Vec<String>,
    /// Indexed keys whose payload is missing.
    pub orphaned: Vec<String>,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    namespace: &str,
    id_attribute: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_existing(path)?;
    let result = inspect(backend, path, namespace, id_attribute)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the summary of one namespace.
pub fn inspect<S: KeyValueStore>(
    backend: Arc<S>,
    path: &Path,
    namespace: &str,
    id_attribute: &str,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let records = RecordStore::new(Arc::clone(&backend), namespace, id_attribute);
    let queue = OperationIndex::new(backend, namespace);

    let keys = records.keys()?;
    let mut orphaned = Vec::new();
    for key in &keys {
        if records.find(key)?.is_none() {
            orphaned.push(key.to_string());
        }
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        namespace: namespace.to_string(),
        record_count: keys.len(),
        temporary_count: keys.iter().filter(|k| k.is_temporary()).count(),
        keys: to_strings(&keys),
        dirty: to_strings(&queue.list(QueueKind::Dirty)?),
        destroyed: to_strings(&queue.list(QueueKind::Destroyed)?),
        orphaned,
    })
}

fn to_strings(keys: &[RecordKey]) -> Vec<String> {
    keys.iter().map(ToString::to_string).collect()
}

fn print_text_output(result: &InspectResult) {
    println!("Tideline Namespace Inspection");
    println!("=============================");
    println!();
    println!("Path:      {}", result.path);
    println!("Namespace: {}", result.namespace);
    println!();
    println!("Records:");
    println!("  Indexed:    {}", result.record_count);
    println!("  Temporary:  {}", result.temporary_count);
    if !result.orphaned.is_empty() {
        println!("  Orphaned:   {}", result.orphaned.len());
    }
    println!();
    println!("Queues:");
    print_queue("dirty", &result.dirty);
    print_queue("destroyed", &result.destroyed);

    if result.dirty.is_empty() && result.destroyed.is_empty() {
        println!();
        println!("✓ Nothing pending");
    }
}

fn print_queue(name: &str, keys: &[String]) {
    println!("  {:<10} {}", format!("{name}:"), keys.len());
    for key in keys {
        println!("    - {key}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideline_engine::Record;
    use tideline_storage::InMemoryStore;

    #[test]
    fn inspect_reports_records_and_queues() {
        let backend = Arc::new(InMemoryStore::new());
        let records = RecordStore::new(Arc::clone(&backend), "/todos", "id");
        let queue = OperationIndex::new(Arc::clone(&backend), "/todos");

        let pending = records.create(Record::new().with("title", "a")).unwrap();
        records.update(&Record::new().with("id", 4)).unwrap();
        queue.mark_dirty(&pending.key("id").unwrap()).unwrap();
        queue.mark_destroyed(&RecordKey::new("9")).unwrap();

        let result = inspect(backend, Path::new("cache.json"), "/todos", "id").unwrap();
        assert_eq!(result.record_count, 2);
        assert_eq!(result.temporary_count, 1);
        assert_eq!(result.dirty.len(), 1);
        assert_eq!(result.destroyed, vec!["9"]);
        assert!(result.orphaned.is_empty());
    }

    #[test]
    fn inspect_flags_orphaned_keys() {
        let backend = Arc::new(InMemoryStore::new());
        let records = RecordStore::new(Arc::clone(&backend), "/todos", "id");
        records.update(&Record::new().with("id", 1)).unwrap();
        backend.remove("/todos/1").unwrap();

        let result = inspect(backend, Path::new("cache.json"), "/todos", "id").unwrap();
        assert_eq!(result.orphaned, vec!["1"]);
    }
}
