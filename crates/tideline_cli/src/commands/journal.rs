//! Journal commands: dump and clear the error journal.

use std::path::Path;
use tideline_engine::{ErrorJournal, JournalEntry};
use tideline_storage::KeyValueStore;
use tracing::info;

/// Runs the journal command.
pub fn run(path: &Path, key: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let journal = ErrorJournal::new(super::open_existing(path)?, key);
    let entries = journal.entries()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

/// Empties the journal. Returns the number of entries removed.
pub fn clear(path: &Path, key: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let journal = ErrorJournal::new(super::open_existing(path)?, key);
    clear_journal(&journal)
}

fn clear_journal<S: KeyValueStore>(
    journal: &ErrorJournal<S>,
) -> Result<usize, Box<dyn std::error::Error>> {
    let removed = journal.len()?;
    journal.clear()?;
    info!(key = journal.key(), removed, "error journal cleared");
    println!("Removed {} journal entries", removed);
    Ok(removed)
}

fn print_text_output(entries: &[JournalEntry]) {
    println!("Tideline Error Journal");
    println!("======================");
    println!();

    if entries.is_empty() {
        println!("✓ No rejected submissions");
        return;
    }

    for (i, entry) in entries.iter().enumerate() {
        println!("[{}] {} status {}", i, entry.namespace, entry.status);
        if let (Some(queue), Some(key)) = (&entry.queue, &entry.key) {
            println!("    {} {}", queue, key);
        }
        println!("    recorded at {} ms", entry.recorded_at);
        println!("    payload: {}", entry.payload);
    }
    println!();
    println!("Total: {} entries", entries.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tideline_engine::{QueueKind, RecordKey};
    use tideline_storage::InMemoryStore;

    #[test]
    fn clear_reports_removed_count() {
        let journal = ErrorJournal::new(Arc::new(InMemoryStore::new()), "sync_errors");
        journal
            .append(
                JournalEntry::new("/todos", 500, json!({"error": "boom"}))
                    .with_record(QueueKind::Dirty, RecordKey::new("1")),
            )
            .unwrap();
        journal
            .append(JournalEntry::new("/todos", 422, json!(null)))
            .unwrap();

        assert_eq!(clear_journal(&journal).unwrap(), 2);
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn missing_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(run(&missing, "sync_errors", "text").is_err());
        assert!(!missing.exists());
    }
}
