//! # Tideline Engine
//!
//! Offline-first reconciliation engine for Tideline.
//!
//! This crate provides:
//! - Persisted record store and record-id index per collection
//! - Dirty and destroyed operation queues
//! - Temporary-to-permanent key remapping
//! - A single-flight sync session with a stall watchdog
//! - Per-operation policy resolution (local, remote, dual)
//! - Queue replay and read/write merge logic
//! - An error journal of server rejections
//!
//! ## Architecture
//!
//! Every operation resolves a [`Policy`] first. Under dual mode writes land
//! in the local store and a queue before anything is sent; a replay then
//! drains the queues one submission at a time, in order:
//! 1. Dirty entries with a temporary key become remote creates
//! 2. The server key replaces the temporary key locally
//! 3. Other dirty entries become remote updates
//! 4. Destroyed entries become remote deletes
//!
//! Reads return the local snapshot immediately while entries are queued and
//! refresh it from the remote store once the queues are empty.
//!
//! ## Key Invariants
//!
//! - A queue never holds the same key twice
//! - At most one replay is in flight
//! - A record never lives under both its temporary and permanent key
//! - Queued local changes are never overwritten by a remote refresh
//! - A delete of a never-synced record never reaches the server
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tideline_engine::{
//!     Collection, Disposition, EngineConfig, MockServer, Record, SyncEngine, SyncOptions,
//! };
//! use tideline_storage::InMemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let server = Arc::new(MockServer::new());
//! let engine = SyncEngine::new(Arc::new(InMemoryStore::new()), server, EngineConfig::default());
//! let todos = Collection::new("/todos").with_options(SyncOptions::dual());
//!
//! engine.connectivity().set_online(false);
//! let written = engine
//!     .create(&todos, Record::new().with("title", "milk"), &SyncOptions::new())
//!     .await
//!     .unwrap();
//! assert_eq!(written.disposition, Disposition::Queued);
//!
//! engine.connectivity().set_online(true);
//! let summary = engine.sync_collection(&todos).await.unwrap();
//! assert_eq!(summary.created, 1);
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod engine;
mod error;
mod index;
mod journal;
mod keys;
mod lock;
mod outcome;
mod policy;
mod record;
mod replay;
mod session;
mod store;
mod transport;

pub use collection::{Collection, DEFAULT_ID_ATTRIBUTE};
pub use config::{Connectivity, EngineConfig, DEFAULT_JOURNAL_KEY, DEFAULT_STALL_TIMEOUT};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use index::{IdSet, OperationIndex, QueueKind};
pub use journal::{ErrorJournal, JournalEntry};
pub use keys::{KeyRemapTable, RemapEntry};
pub use lock::StoreLock;
pub use outcome::{Background, Disposition, ReadOutcome, ReplaySummary, Source, WriteOutcome};
pub use policy::{Online, Policy, Returns, SyncOptions};
pub use record::{Record, RecordKey, RecordSet, Snapshot, Target};
pub use session::{
    CompletionSignal, SessionGuard, SessionOutcome, SessionCheck, SessionStart, SessionState,
    SyncContext, TransportActivity, STALL_REASON,
};
pub use store::RecordStore;
pub use transport::{Method, MockServer, Request, Transport, TransportFailure, CONNECTIVITY_STATUS};
