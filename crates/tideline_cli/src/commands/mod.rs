//! CLI command implementations.

pub mod inspect;
pub mod journal;

use std::path::Path;
use std::sync::Arc;
use tideline_storage::FileStore;

/// Opens an existing cache file. Unlike [`FileStore::open`], a missing file
/// is an error here: inspecting must never create one.
pub fn open_existing(path: &Path) -> Result<Arc<FileStore>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No cache found at {:?}", path).into());
    }
    Ok(Arc::new(FileStore::open(path)?))
}
