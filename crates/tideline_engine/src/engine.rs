//! The reconciliation engine: read and write paths.

use crate::collection::Collection;
use crate::config::{Connectivity, EngineConfig};
use crate::error::{SyncError, SyncResult};
use crate::index::{OperationIndex, QueueKind};
use crate::journal::ErrorJournal;
use crate::keys::RemapEntry;
use crate::lock::StoreLock;
use crate::outcome::{Background, Disposition, ReadOutcome, ReplaySummary, Source, WriteOutcome};
use crate::policy::{Policy, Returns, SyncOptions};
use crate::record::{Record, RecordKey, Snapshot, Target};
use crate::session::{SessionGuard, SessionStart, SyncContext};
use crate::store::RecordStore;
use crate::transport::{Method, Request, Transport};
use serde_json::Value;
use std::sync::Arc;
use tideline_storage::KeyValueStore;
use tracing::{debug, warn};

/// How many times an operation re-checks the queue after joining another
/// caller's session before giving up and leaving its entries queued.
const MAX_SETTLE_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Create,
    Update,
    Delete,
}

pub(crate) struct EngineInner<S: KeyValueStore, T: Transport> {
    pub(crate) backend: Arc<S>,
    pub(crate) transport: Arc<T>,
    pub(crate) config: EngineConfig,
    pub(crate) context: SyncContext,
    pub(crate) journal: ErrorJournal<S>,
    /// Serializes every read-modify-write of the shared backend.
    pub(crate) lock: StoreLock,
}

/// Offline-first sync engine over a local key-value store and a remote
/// transport.
///
/// Cheap to clone; clones share the same session context.
///
/// # Write paths
///
/// | Mode | Record key | Behavior |
/// |------|------------|----------|
/// | dual, online | absent or temporary | local write, queued, background replay |
/// | dual, online | permanent | local write, queued, replayed before returning |
/// | dual, offline | any | local write, queued |
/// | local only | any | local write |
/// | remote | any | remote call only |
pub struct SyncEngine<S: KeyValueStore, T: Transport> {
    pub(crate) inner: Arc<EngineInner<S, T>>,
}

impl<S: KeyValueStore, T: Transport> Clone for SyncEngine<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, T> SyncEngine<S, T>
where
    S: KeyValueStore + 'static,
    T: Transport + 'static,
{
    /// Creates an engine with an idle session context.
    pub fn new(backend: Arc<S>, transport: Arc<T>, config: EngineConfig) -> Self {
        let context = SyncContext::new(config.stall_timeout);
        let lock = StoreLock::new();
        let journal = ErrorJournal::new(Arc::clone(&backend), config.journal_key.clone())
            .with_lock(lock.clone());
        Self {
            inner: Arc::new(EngineInner {
                backend,
                transport,
                config,
                context,
                journal,
                lock,
            }),
        }
    }

    /// The session context.
    pub fn context(&self) -> &SyncContext {
        &self.inner.context
    }

    /// The ambient connectivity flag.
    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.config.connectivity
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The error journal.
    pub fn journal(&self) -> &ErrorJournal<S> {
        &self.inner.journal
    }

    /// The persisted records of a collection.
    pub fn records(&self, collection: &Collection) -> RecordStore<S> {
        RecordStore::new(
            Arc::clone(&self.inner.backend),
            collection.namespace(),
            collection.id_attribute(),
        )
        .with_lock(self.inner.lock.clone())
    }

    /// The pending-operation queues of a collection.
    pub fn queue(&self, collection: &Collection) -> OperationIndex<S> {
        OperationIndex::new(Arc::clone(&self.inner.backend), collection.namespace())
            .with_lock(self.inner.lock.clone())
    }

    /// Closes any active session and rejects further operations.
    pub fn dispose(&self) {
        self.inner.context.dispose();
    }

    fn ensure_live(&self) -> SyncResult<()> {
        if self.inner.context.is_disposed() {
            return Err(SyncError::SessionFailed("engine disposed".into()));
        }
        Ok(())
    }

    /// Resolves the flags of one operation and applies the offline failsafe.
    pub fn policy(&self, collection: &Collection, options: &SyncOptions) -> SyncResult<Policy> {
        let local_empty = self.records(collection).is_empty()?;
        let policy = Policy::resolve(
            options,
            collection.options(),
            &self.inner.config.connectivity,
            local_empty,
        );
        if !policy.online && self.inner.context.stop("offline", true) {
            debug!(namespace = collection.namespace(), "offline, closed active sync session");
        }
        Ok(policy)
    }

    /// Maps a temporary key to its permanent key when one is known.
    pub fn resolve_key(&self, key: &RecordKey) -> RecordKey {
        if !key.is_temporary() {
            return key.clone();
        }
        self.inner
            .context
            .with_keys(|keys| keys.resolve(key))
            .unwrap_or_else(|| key.clone())
    }

    /// Swaps every temporary key the server has replaced in an in-memory
    /// target. Returns the number of known remaps.
    pub fn apply_remaps<G: Target>(&self, collection: &Collection, target: &mut G) -> usize {
        let remaps = self.inner.context.with_keys(|keys| keys.permanent_entries());
        for (temporary, permanent) in &remaps {
            target.rekey(collection.id_attribute(), temporary, permanent);
        }
        remaps.len()
    }

    pub(crate) async fn submit(&self, request: Request) -> SyncResult<Value> {
        let _activity = self.inner.context.track_transport();
        debug!(method = %request.method, url = %request.url, "submitting request");
        Ok(self.inner.transport.send(request).await?)
    }

    // ---- writes ----

    /// Creates a record.
    pub async fn create(
        &self,
        collection: &Collection,
        record: Record,
        options: &SyncOptions,
    ) -> SyncResult<WriteOutcome> {
        self.write(collection, WriteKind::Create, record, options).await
    }

    /// Updates a record. A record without identity is created instead.
    pub async fn update(
        &self,
        collection: &Collection,
        record: Record,
        options: &SyncOptions,
    ) -> SyncResult<WriteOutcome> {
        self.write(collection, WriteKind::Update, record, options).await
    }

    /// Deletes a record.
    pub async fn delete(
        &self,
        collection: &Collection,
        record: Record,
        options: &SyncOptions,
    ) -> SyncResult<WriteOutcome> {
        self.write(collection, WriteKind::Delete, record, options).await
    }

    async fn write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        record: Record,
        options: &SyncOptions,
    ) -> SyncResult<WriteOutcome> {
        self.ensure_live()?;
        if kind != WriteKind::Delete {
            collection.validate(&record)?;
        }
        let policy = self.policy(collection, options)?;
        let (kind, record) = self.resolve_write(collection, &policy, kind, record).await?;
        if policy.dual_sync && policy.local {
            self.dual_write(collection, kind, record).await
        } else {
            self.simple_write(collection, kind, record, policy).await
        }
    }

    /// Rewrites a write addressed to a temporary key the server has already
    /// replaced, so it targets the permanent key instead. Online dual writes
    /// first wait for a replay that is creating the record right now.
    async fn resolve_write(
        &self,
        collection: &Collection,
        policy: &Policy,
        mut kind: WriteKind,
        mut record: Record,
    ) -> SyncResult<(WriteKind, Record)> {
        let id = collection.id_attribute();
        let Some(temporary) = record.key(id).filter(RecordKey::is_temporary) else {
            return Ok((kind, record));
        };

        let context = &self.inner.context;
        match context.remap_entry(&temporary) {
            None => return Ok((kind, record)),
            Some(RemapEntry::Provisional(_)) if policy.dual_sync => {
                if let Some(outcome) = context.join_active().await {
                    debug!(%temporary, ?outcome, "joined replay of a pending create");
                }
            }
            Some(_) => {}
        }
        let Some(permanent) = context.with_keys(|keys| keys.resolve(&temporary)) else {
            return Ok((kind, record));
        };

        debug!(%temporary, %permanent, "rewriting write to permanent key");
        record.set_key(id, &permanent);
        if kind == WriteKind::Create {
            kind = WriteKind::Update;
        }
        if policy.local {
            let _held = self.inner.lock.acquire();
            self.records(collection).destroy_key(&temporary)?;
            self.queue(collection).clear(QueueKind::Dirty, &temporary)?;
        }
        Ok((kind, record))
    }

    async fn simple_write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        record: Record,
        policy: Policy,
    ) -> SyncResult<WriteOutcome> {
        if policy.remote && (policy.online || !policy.local) {
            let record = self.remote_write(collection, kind, record).await?;
            return Ok(WriteOutcome::new(record, Disposition::RemoteOnly));
        }

        let queued = policy.dual_configured;
        let stored = self.local_write(collection, kind, record, queued)?;
        let disposition = match (queued, kind, stored.key(collection.id_attribute())) {
            (true, WriteKind::Delete, Some(key)) if key.is_temporary() => Disposition::Cancelled,
            (true, WriteKind::Delete, None) => Disposition::LocalOnly,
            (true, _, _) => Disposition::Queued,
            (false, _, _) => Disposition::LocalOnly,
        };
        Ok(WriteOutcome::new(stored, disposition))
    }

    async fn remote_write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        mut record: Record,
    ) -> SyncResult<Record> {
        let id = collection.id_attribute();
        let key = record.key(id).filter(|k| !k.is_temporary());
        let request = match (kind, key) {
            (WriteKind::Delete, None) => return Ok(record),
            (WriteKind::Delete, Some(key)) => Request::delete(collection.record_url(&key)),
            (WriteKind::Create, _) | (WriteKind::Update, None) => {
                let mut body = record.clone();
                body.clear_key(id);
                Request::create(collection.url(), body.into_value())
            }
            (_, Some(key)) => Request::update(collection.record_url(&key), record.clone().into_value()),
        };
        let is_delete = request.method == Method::Delete;
        let response = self.submit(request).await?;
        if !is_delete {
            if let Some(fresh) = Record::from_value(collection.parse(response)) {
                record.merge(&fresh);
            }
        }
        Ok(record)
    }

    /// Applies a write to the local store and its queues.
    ///
    /// With `queued`, creates and updates are marked dirty and deletes of
    /// confirmed records are marked destroyed. A delete of a record that
    /// only has a temporary key cancels its pending create instead.
    fn local_write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        record: Record,
        queued: bool,
    ) -> SyncResult<Record> {
        let records = self.records(collection);
        let queue = self.queue(collection);
        let id = collection.id_attribute();
        let _held = self.inner.lock.acquire();

        match (kind, record.key(id)) {
            (WriteKind::Delete, key) => {
                let record = records.destroy(&record)?;
                match key {
                    Some(key) if key.is_temporary() => {
                        queue.clear(QueueKind::Dirty, &key)?;
                        debug!(namespace = collection.namespace(), %key, "cancelled pending create");
                    }
                    Some(key) if queued => {
                        queue.mark_destroyed(&key)?;
                        queue.clear(QueueKind::Dirty, &key)?;
                    }
                    Some(key) => {
                        queue.clear(QueueKind::Destroyed, &key)?;
                    }
                    None => {}
                }
                Ok(record)
            }
            (WriteKind::Create, _) | (WriteKind::Update, None) => {
                let stored = records.create(record)?;
                if queued {
                    if let Some(key) = stored.key(id) {
                        queue.mark_dirty(&key)?;
                    }
                }
                Ok(stored)
            }
            (_, Some(key)) => {
                let stored = records.update(&record)?;
                if queued {
                    queue.mark_dirty(&key)?;
                } else {
                    queue.clear(QueueKind::Dirty, &key)?;
                }
                Ok(stored)
            }
        }
    }

    async fn dual_write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        record: Record,
    ) -> SyncResult<WriteOutcome> {
        match record.key(collection.id_attribute()) {
            Some(key) if !key.is_temporary() => {
                self.confirmed_write(collection, kind, record, key).await
            }
            _ => self.unsynced_write(collection, kind, record),
        }
    }

    /// Write of a record the server has never seen. Applied locally at once;
    /// the remote side is left to the next replay.
    fn unsynced_write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        record: Record,
    ) -> SyncResult<WriteOutcome> {
        let key = record.key(collection.id_attribute());
        let stored = self.local_write(collection, kind, record, true)?;
        let disposition = match (kind, key) {
            (WriteKind::Delete, None) => Disposition::LocalOnly,
            (WriteKind::Delete, Some(_)) => Disposition::Cancelled,
            _ => Disposition::Queued,
        };

        let mut outcome = WriteOutcome::new(stored, disposition);
        if self.queue(collection).has_any()? {
            if let SessionStart::Started(guard) = self.inner.context.start("write") {
                let engine = self.clone();
                let collection = collection.clone();
                outcome.replay = Some(Background::spawn(async move {
                    engine.run_replay(&collection, guard).await
                }));
            }
        }
        Ok(outcome)
    }

    /// Write of a record with a permanent key. The local copy is updated and
    /// queued first, then the queue is replayed in order so this write lands
    /// after everything queued before it.
    async fn confirmed_write(
        &self,
        collection: &Collection,
        kind: WriteKind,
        record: Record,
        key: RecordKey,
    ) -> SyncResult<WriteOutcome> {
        let stored = self.local_write(collection, kind, record, true)?;
        let queue_kind = if kind == WriteKind::Delete {
            QueueKind::Destroyed
        } else {
            QueueKind::Dirty
        };

        self.settle(collection, "write", None).await?;

        if let Some(failure) = self.inner.context.rejection(collection.namespace(), &key) {
            return Err(failure.into());
        }
        if self.queue(collection).contains(queue_kind, &key)? {
            return Ok(WriteOutcome::new(stored, Disposition::Queued));
        }
        let record = match queue_kind {
            QueueKind::Dirty => self.records(collection).find(&key)?.unwrap_or(stored),
            QueueKind::Destroyed => stored,
        };
        Ok(WriteOutcome::new(record, Disposition::Synced))
    }

    /// Drains the queues of a collection within a session.
    ///
    /// With a guard, replays under that session. Otherwise opens a session,
    /// or joins the active one and retries if entries of this collection are
    /// still queued once it ends. Returns the summary of the replay this call
    /// ran, if any.
    pub(crate) async fn settle(
        &self,
        collection: &Collection,
        reason: &str,
        guard: Option<SessionGuard>,
    ) -> SyncResult<Option<ReplaySummary>> {
        if let Some(guard) = guard {
            return self.run_replay(collection, guard).await.map(Some);
        }
        for _ in 0..MAX_SETTLE_ROUNDS {
            if !self.queue(collection).has_any()? {
                return Ok(None);
            }
            match self.inner.context.start(reason) {
                SessionStart::Started(guard) => {
                    return self.run_replay(collection, guard).await.map(Some);
                }
                SessionStart::Joined(signal) => {
                    let outcome = self.inner.context.join(signal).await;
                    if !outcome.is_success() {
                        debug!(namespace = collection.namespace(), ?outcome, "joined session failed");
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Replays the queues of a collection now.
    pub async fn sync_collection(&self, collection: &Collection) -> SyncResult<ReplaySummary> {
        self.ensure_live()?;
        Ok(self
            .settle(collection, "sync", None)
            .await?
            .unwrap_or_default())
    }

    // ---- reads ----

    /// Reads a single record or a whole collection.
    ///
    /// Under dual mode a non-empty local snapshot is returned at once when
    /// the collection has queued entries or prefers local results; the
    /// remote fetch then continues in [`ReadOutcome::refresh`].
    pub async fn read<G: Target>(
        &self,
        collection: &Collection,
        target: &G,
        options: &SyncOptions,
    ) -> SyncResult<ReadOutcome> {
        self.ensure_live()?;
        let key = target
            .key(collection.id_attribute())
            .map(|k| self.resolve_key(&k));
        let policy = self.policy(collection, options)?;
        if policy.dual_sync && policy.local {
            self.dual_read(collection, key, policy).await
        } else {
            self.simple_read(collection, key, policy).await
        }
    }

    /// Reads into an in-memory target, replacing its state.
    pub async fn read_into<G: Target>(
        &self,
        collection: &Collection,
        target: &mut G,
        options: &SyncOptions,
    ) -> SyncResult<ReadOutcome> {
        let outcome = self.read(collection, &*target, options).await?;
        target.absorb(collection.id_attribute(), outcome.snapshot.clone());
        Ok(outcome)
    }

    async fn simple_read(
        &self,
        collection: &Collection,
        key: Option<RecordKey>,
        policy: Policy,
    ) -> SyncResult<ReadOutcome> {
        if policy.remote && (policy.online || !policy.local) {
            let snapshot = self.fetch_remote(collection, key.as_ref()).await?;
            return Ok(ReadOutcome::new(snapshot, Source::Remote));
        }
        match self.local_snapshot(collection, key.as_ref())? {
            Snapshot::NotFound => Err(SyncError::NotFound(
                key.map(|k| k.to_string()).unwrap_or_default(),
            )),
            snapshot => Ok(ReadOutcome::new(snapshot, Source::Local)),
        }
    }

    async fn dual_read(
        &self,
        collection: &Collection,
        key: Option<RecordKey>,
        policy: Policy,
    ) -> SyncResult<ReadOutcome> {
        let dirty = self.queue(collection).has_any()?;
        // open the session before anything else so the fetch queues behind the replay
        let guard = if dirty {
            match self.inner.context.start("read") {
                SessionStart::Started(guard) => Some(guard),
                SessionStart::Joined(_) => None,
            }
        } else {
            None
        };

        let local = if dirty || policy.returns == Returns::Local {
            Some(self.local_snapshot(collection, key.as_ref())?)
        } else {
            None
        };

        let engine = self.clone();
        let owned = collection.clone();
        let fetch_key = key.clone();
        let fetch = Background::spawn(async move {
            engine
                .settle_and_fetch(&owned, fetch_key, guard)
                .await
        });

        match local {
            Some(snapshot) if !snapshot.is_empty() => Ok(ReadOutcome {
                snapshot,
                source: Source::Local,
                refresh: Some(fetch),
            }),
            local => match fetch.wait().await {
                Ok(snapshot) => Ok(ReadOutcome::new(snapshot, Source::Remote)),
                Err(err) => {
                    let fallback = match local {
                        Some(snapshot) => snapshot,
                        None => self.local_snapshot(collection, key.as_ref())?,
                    };
                    match fallback {
                        Snapshot::NotFound => Err(err),
                        snapshot => {
                            warn!(namespace = collection.namespace(), error = %err, "remote read failed, serving local snapshot");
                            Ok(ReadOutcome::new(snapshot, Source::Local))
                        }
                    }
                }
            },
        }
    }

    async fn settle_and_fetch(
        &self,
        collection: &Collection,
        key: Option<RecordKey>,
        guard: Option<SessionGuard>,
    ) -> SyncResult<Snapshot> {
        if let Some(summary) = self.settle(collection, "read", guard).await? {
            if summary.interrupted {
                return Err(SyncError::Connectivity("replay interrupted".into()));
            }
        }

        let key = key.map(|k| self.resolve_key(&k));
        if let Some(key) = key.as_ref().filter(|k| k.is_temporary()) {
            // never created remotely; nothing to fetch
            return self.local_snapshot(collection, Some(key));
        }
        let snapshot = self.fetch_remote(collection, key.as_ref()).await?;
        self.rehydrate(collection, key.as_ref(), &snapshot)?;
        Ok(snapshot)
    }

    /// Refetches from the remote store and replaces the local copy, unless
    /// entries are still queued.
    pub async fn refresh(
        &self,
        collection: &Collection,
        key: Option<&RecordKey>,
    ) -> SyncResult<Snapshot> {
        self.ensure_live()?;
        let snapshot = self.fetch_remote(collection, key).await?;
        self.rehydrate(collection, key, &snapshot)?;
        Ok(snapshot)
    }

    pub(crate) async fn fetch_remote(
        &self,
        collection: &Collection,
        key: Option<&RecordKey>,
    ) -> SyncResult<Snapshot> {
        let url = match key {
            Some(key) => collection.record_url(key),
            None => collection.url().to_string(),
        };
        let body = self.submit(Request::read(url)).await?;
        Ok(Snapshot::from_response(collection.parse(body)))
    }

    fn local_snapshot(
        &self,
        collection: &Collection,
        key: Option<&RecordKey>,
    ) -> SyncResult<Snapshot> {
        let records = self.records(collection);
        Ok(match key {
            Some(key) => records
                .find(key)?
                .map(Snapshot::Record)
                .unwrap_or(Snapshot::NotFound),
            None => Snapshot::Records(records.find_all()?),
        })
    }

    /// Replaces local state with a remote snapshot. Collections are cleared
    /// and refilled; a single record replaces only itself. Skipped while any
    /// entry is queued. Returns true if applied.
    pub(crate) fn rehydrate(
        &self,
        collection: &Collection,
        key: Option<&RecordKey>,
        snapshot: &Snapshot,
    ) -> SyncResult<bool> {
        let _held = self.inner.lock.acquire();
        if self.queue(collection).has_any()? {
            debug!(namespace = collection.namespace(), "queued entries remain, keeping local copy");
            return Ok(false);
        }
        let records = self.records(collection);
        let id = collection.id_attribute();
        match (key, snapshot) {
            (None, Snapshot::Records(fresh)) => {
                records.clear()?;
                for record in fresh {
                    if record.key(id).is_some() {
                        records.update(record)?;
                    }
                }
            }
            (_, Snapshot::Record(fresh)) => {
                if let Some(old) = key.filter(|k| fresh.key(id).as_ref() != Some(*k)) {
                    records.destroy_key(old)?;
                }
                if fresh.key(id).is_some() {
                    records.update(fresh)?;
                }
            }
            _ => return Ok(false),
        }
        debug!(namespace = collection.namespace(), count = snapshot.len(), "rehydrated local copy");
        Ok(true)
    }
}
