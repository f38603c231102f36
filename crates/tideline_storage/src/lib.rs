//! # Tideline Storage
//!
//! Persisted key-value primitive for the Tideline sync engine.
//!
//! This crate provides the lowest-level storage abstraction used by the
//! engine's record store, operation index and error journal. Stores are
//! **opaque string maps** - they do not interpret the values they hold.
//!
//! ## Design Principles
//!
//! - Stores are simple string maps (get, set, remove)
//! - Every mutation is durable before it returns
//! - No knowledge of records, queues or namespaces
//! - Must be `Send + Sync` for use from spawned tasks
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral caches
//! - [`FileStore`] - A single JSON document on disk, rewritten atomically
//!
//! ## Example
//!
//! ```rust
//! use tideline_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.set("todos/1", r#"{"id":1}"#).unwrap();
//! assert_eq!(store.get("todos/1").unwrap().as_deref(), Some(r#"{"id":1}"#));
//! store.remove("todos/1").unwrap();
//! assert!(!store.contains("todos/1").unwrap());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::KeyValueStore;
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
