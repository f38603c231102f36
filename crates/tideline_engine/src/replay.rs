//! Queue replay.
//!
//! A replay drains the dirty queue, then the destroyed queue, of one
//! collection. Submissions go out one at a time in queue order; each outcome
//! is applied locally before the next request is issued, so an update can
//! never overtake the create that produced its key. Entries queued while the
//! replay runs are picked up by the same replay.
//!
//! Local edits may land while a submission is in flight. The outcome is
//! applied against the record as it is stored when the response arrives,
//! never against the copy that was sent.

use crate::collection::Collection;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::index::QueueKind;
use crate::journal::JournalEntry;
use crate::keys::RemapEntry;
use crate::outcome::ReplaySummary;
use crate::record::{Record, RecordKey};
use crate::session::SessionGuard;
use crate::transport::{Method, Request, Transport, TransportFailure};
use std::collections::HashSet;
use tideline_storage::KeyValueStore;
use tracing::{debug, info, warn};

/// What the drain does after one entry.
enum Step {
    Continue,
    Halt,
}

impl<S, T> SyncEngine<S, T>
where
    S: KeyValueStore + 'static,
    T: Transport + 'static,
{
    /// Replays the queues of `collection` under the session owned by `guard`
    /// and closes the session when done.
    pub(crate) async fn run_replay(
        &self,
        collection: &Collection,
        guard: SessionGuard,
    ) -> SyncResult<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let drained = self.drain(collection, &guard, &mut summary).await;

        let recover = drained.is_ok() && !summary.interrupted && summary.failed > 0;
        if recover && self.inner.context.schedule_recovery() {
            match self.fetch_remote(collection, None).await {
                Ok(snapshot) => {
                    summary.recovered = self.rehydrate(collection, None, &snapshot)?;
                }
                Err(err) => warn!(namespace = collection.namespace(), error = %err, "recovery refetch failed"),
            }
        }

        match drained {
            Ok(()) => {
                info!(
                    namespace = collection.namespace(),
                    created = summary.created,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    failed = summary.failed,
                    interrupted = summary.interrupted,
                    "replay finished"
                );
                let reason = if summary.interrupted { "offline" } else { "replayed" };
                guard.finish(reason, !summary.interrupted);
                Ok(summary)
            }
            Err(err) => {
                guard.finish("replay error", false);
                Err(err)
            }
        }
    }

    async fn drain(
        &self,
        collection: &Collection,
        guard: &SessionGuard,
        summary: &mut ReplaySummary,
    ) -> SyncResult<()> {
        let queue = self.queue(collection);

        for kind in [QueueKind::Dirty, QueueKind::Destroyed] {
            let mut attempted = HashSet::new();
            loop {
                if guard.is_superseded() {
                    warn!(
                        namespace = collection.namespace(),
                        generation = guard.generation(),
                        "session abandoned, stopping replay"
                    );
                    summary.interrupted = true;
                    return Ok(());
                }
                // re-list after every submission to pick up entries added mid-flight
                let next = queue
                    .list(kind)?
                    .into_iter()
                    .find(|key| !attempted.contains(key));
                let Some(key) = next else { break };
                attempted.insert(key.clone());

                let step = match kind {
                    QueueKind::Dirty => self.replay_dirty(collection, &key, summary).await?,
                    QueueKind::Destroyed => self.replay_destroyed(collection, &key, summary).await?,
                };
                if let Step::Halt = step {
                    summary.interrupted = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn replay_dirty(
        &self,
        collection: &Collection,
        key: &RecordKey,
        summary: &mut ReplaySummary,
    ) -> SyncResult<Step> {
        let id = collection.id_attribute();
        let queue = self.queue(collection);
        let records = self.records(collection);
        let context = &self.inner.context;

        let Some(stored) = records.find(key)? else {
            debug!(namespace = collection.namespace(), %key, "queued record is gone, dropping entry");
            queue.clear(QueueKind::Dirty, key)?;
            return Ok(Step::Continue);
        };

        let mut record = stored.clone();
        let mut provisional = false;
        let request = if key.is_temporary() {
            match context.remap_entry(key) {
                None => {
                    context.with_keys(|keys| keys.put_provisional(key.clone(), collection.namespace()));
                    provisional = true;
                    let mut body = record.clone();
                    body.clear_key(id);
                    Request::create(collection.url(), body.into_value())
                }
                Some(RemapEntry::Permanent(permanent)) => {
                    record.set_key(id, &permanent);
                    Request::update(collection.record_url(&permanent), record.clone().into_value())
                }
                Some(RemapEntry::Provisional(_)) => {
                    debug!(%key, "create already in flight");
                    return Ok(Step::Continue);
                }
            }
        } else {
            Request::update(collection.record_url(key), record.clone().into_value())
        };
        let creating = request.method == Method::Create;
        debug!(namespace = collection.namespace(), %key, method = %request.method, "replaying dirty entry");

        let body = match self.submit(request).await {
            Ok(body) => body,
            Err(err) => {
                if provisional {
                    context.with_keys(|keys| keys.forget(key));
                }
                return self.settle_failure(collection, QueueKind::Dirty, key, err, summary);
            }
        };

        if let Some(fresh) = Record::from_value(collection.parse(body)) {
            record.merge(&fresh);
        }
        let assigned = record
            .key(id)
            .filter(|permanent| key.is_temporary() && !permanent.is_temporary());

        let _held = self.inner.lock.acquire();
        let current = records.find(key)?;
        match (current, assigned) {
            (None, assigned) => {
                // deleted locally while the request was out
                queue.clear(QueueKind::Dirty, key)?;
                if let Some(permanent) = assigned {
                    context.with_keys(|keys| keys.put(key.clone(), permanent.clone()));
                    queue.mark_destroyed(&permanent)?;
                    debug!(%key, %permanent, "created record was deleted meanwhile, queued remote delete");
                }
            }
            (Some(mut current), Some(permanent)) if current != stored => {
                // edited meanwhile: keep the edit, queue it under the new key
                queue.clear(QueueKind::Dirty, key)?;
                current.set_key(id, &permanent);
                records.destroy_key(key)?;
                records.update(&current)?;
                queue.mark_dirty(&permanent)?;
                context.with_keys(|keys| keys.put(key.clone(), permanent.clone()));
                debug!(%key, %permanent, "temporary key replaced, newer edit requeued");
            }
            (Some(current), None) if current != stored => {
                debug!(namespace = collection.namespace(), %key, "record edited meanwhile, left queued");
            }
            (Some(_), Some(permanent)) => {
                queue.clear(QueueKind::Dirty, key)?;
                records.destroy_key(key)?;
                records.update(&record)?;
                context.with_keys(|keys| keys.put(key.clone(), permanent.clone()));
                debug!(%key, %permanent, "temporary key replaced");
            }
            (Some(_), None) => {
                queue.clear(QueueKind::Dirty, key)?;
                if record.key(id).is_none() {
                    warn!(namespace = collection.namespace(), %key, "server response carried no key");
                    context.with_keys(|keys| keys.forget(key));
                    record.set_key(id, key);
                } else if provisional {
                    context.with_keys(|keys| keys.forget(key));
                }
                records.update(&record)?;
            }
        }

        if creating {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
        Ok(Step::Continue)
    }

    async fn replay_destroyed(
        &self,
        collection: &Collection,
        key: &RecordKey,
        summary: &mut ReplaySummary,
    ) -> SyncResult<Step> {
        let queue = self.queue(collection);

        let target = if key.is_temporary() {
            match self.inner.context.with_keys(|keys| keys.resolve(key)) {
                Some(permanent) => permanent,
                None => {
                    debug!(%key, "never created remotely, dropping delete");
                    queue.clear(QueueKind::Destroyed, key)?;
                    return Ok(Step::Continue);
                }
            }
        } else {
            key.clone()
        };
        debug!(namespace = collection.namespace(), key = %target, "replaying destroyed entry");

        match self.submit(Request::delete(collection.record_url(&target))).await {
            Ok(_) => {
                let _held = self.inner.lock.acquire();
                queue.clear(QueueKind::Destroyed, key)?;
                let records = self.records(collection);
                records.destroy_key(&target)?;
                if &target != key {
                    records.destroy_key(key)?;
                }
                summary.deleted += 1;
                Ok(Step::Continue)
            }
            Err(err) => self.settle_failure(collection, QueueKind::Destroyed, key, err, summary),
        }
    }

    /// Applies a failed submission. Connectivity failures leave the entry
    /// queued and halt the drain; server rejections purge the entry and are
    /// journaled.
    fn settle_failure(
        &self,
        collection: &Collection,
        kind: QueueKind,
        key: &RecordKey,
        err: SyncError,
        summary: &mut ReplaySummary,
    ) -> SyncResult<Step> {
        match err {
            SyncError::Connectivity(reason) => {
                warn!(namespace = collection.namespace(), %key, %reason, "offline, stopping replay");
                Ok(Step::Halt)
            }
            SyncError::Server { status, payload } => {
                warn!(namespace = collection.namespace(), %key, status, %kind, "server rejected entry, purging");
                self.queue(collection).clear(kind, key)?;
                self.inner.journal.append(
                    JournalEntry::new(collection.namespace(), status, payload.clone())
                        .with_record(kind, key.clone()),
                )?;
                self.inner.context.record_rejection(
                    collection.namespace(),
                    key,
                    TransportFailure::new(status, payload),
                );
                summary.failed += 1;
                Ok(Step::Continue)
            }
            other => Err(other),
        }
    }
}
