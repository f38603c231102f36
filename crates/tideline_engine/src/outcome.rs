//! Typed results of engine operations.

use crate::error::SyncResult;
use crate::record::{Record, Snapshot};
use std::future::Future;
use tokio::task::JoinHandle;

/// Where a read result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The persisted local store.
    Local,
    /// The remote store.
    Remote,
}

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Confirmed by the remote store and applied locally.
    Synced,
    /// Applied locally and queued for the next replay.
    Queued,
    /// Applied locally; the remote store does not participate.
    LocalOnly,
    /// Sent to the remote store only.
    RemoteOnly,
    /// A delete cancelled a create the remote store never saw.
    Cancelled,
}

/// Work continuing after an operation returned.
///
/// Await it with [`Background::wait`] or drop it to let it run detached.
#[derive(Debug)]
pub struct Background<T> {
    handle: JoinHandle<SyncResult<T>>,
}

impl<T: Send + 'static> Background<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = SyncResult<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Waits for the work to finish.
    pub async fn wait(self) -> SyncResult<T> {
        self.handle.await?
    }

    /// Returns true once the work has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Result of a read.
#[derive(Debug)]
pub struct ReadOutcome {
    /// The records read.
    pub snapshot: Snapshot,
    /// Which store answered.
    pub source: Source,
    /// The remote fetch still running when a local snapshot was returned
    /// first. Resolves to the remote snapshot once it has been applied.
    pub refresh: Option<Background<Snapshot>>,
}

impl ReadOutcome {
    pub(crate) fn new(snapshot: Snapshot, source: Source) -> Self {
        Self {
            snapshot,
            source,
            refresh: None,
        }
    }
}

/// Result of a write.
#[derive(Debug)]
pub struct WriteOutcome {
    /// The record as stored after the write.
    pub record: Record,
    /// What happened to it.
    pub disposition: Disposition,
    /// The replay started on behalf of this write, if any.
    pub replay: Option<Background<ReplaySummary>>,
}

impl WriteOutcome {
    pub(crate) fn new(record: Record, disposition: Disposition) -> Self {
        Self {
            record,
            disposition,
            replay: None,
        }
    }
}

/// Counts of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Remote creates confirmed.
    pub created: usize,
    /// Remote updates confirmed.
    pub updated: usize,
    /// Remote deletes confirmed.
    pub deleted: usize,
    /// Submissions rejected by the server and purged.
    pub failed: usize,
    /// Draining stopped on a connectivity failure or because the session was
    /// abandoned; the rest stays queued.
    pub interrupted: bool,
    /// A forced refetch was run to repair local state.
    pub recovered: bool,
}

impl ReplaySummary {
    /// Number of submissions confirmed.
    pub fn submitted(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}
