//! The single-flight sync session and its context.
//!
//! A [`SyncContext`] owns everything that lives for the duration of a
//! replay: the idle/active state, the completion signal that joiners wait
//! on, the key remap table, the forced-recovery flag and the count of
//! outstanding transport calls the stall watchdog looks at.
//!
//! ```text
//!            start()                      stop() / watchdog / guard drop
//!   Idle ──────────────────▶ Active ─────────────────────────────────────▶ Idle
//!              │                │
//!              │                └── start() again: joins, same signal
//!              └── resets keys, clears recovery flag, new signal
//! ```
//!
//! A session closed by `stop()` while its replay is still draining is only
//! released, not abandoned: the next `start()` reopens it under the same
//! generation and joins the running replay instead of starting another one.
//! The watchdog and `reset()` abandon the replay; it halts at its next
//! submission.

use crate::error::{SyncError, SyncResult};
use crate::keys::{KeyRemapTable, RemapEntry};
use crate::record::RecordKey;
use crate::transport::TransportFailure;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reason recorded when the watchdog closes a stalled session.
pub const STALL_REASON: &str = "timeout";

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No replay in progress.
    Idle,
    /// A replay is in progress.
    Active,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every submission was applied.
    Completed,
    /// The session was stopped with a failure.
    Failed(String),
    /// The watchdog closed the session.
    Stalled,
}

impl SessionOutcome {
    /// Returns true for [`SessionOutcome::Completed`].
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }

    /// Converts the outcome into a result for callers that waited on it.
    pub fn into_result(self) -> SyncResult<()> {
        match self {
            SessionOutcome::Completed => Ok(()),
            SessionOutcome::Failed(reason) => Err(SyncError::SessionFailed(reason)),
            SessionOutcome::Stalled => Err(SyncError::StallTimeout),
        }
    }
}

/// A join-able completion signal, resolved exactly once per session.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    generation: u64,
    receiver: watch::Receiver<Option<SessionOutcome>>,
}

impl CompletionSignal {
    /// The session this signal belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the outcome if the session already ended.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.receiver.borrow().clone()
    }

    /// Waits for the session to end.
    pub async fn wait(&mut self) -> SessionOutcome {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| SessionOutcome::Failed("signal lost".into())),
            Err(_) => SessionOutcome::Failed("signal lost".into()),
        }
    }

    /// Returns true if both signals belong to the same session.
    pub fn same_session(&self, other: &CompletionSignal) -> bool {
        self.generation == other.generation && self.receiver.same_channel(&other.receiver)
    }
}

/// Result of [`SyncContext::start`].
#[derive(Debug)]
pub enum SessionStart {
    /// This caller opened the session and must finish it.
    Started(SessionGuard),
    /// A session was already active; wait on its signal.
    Joined(CompletionSignal),
}

/// Result of [`SyncContext::check`].
#[derive(Debug)]
pub enum SessionCheck {
    /// No session is active.
    NotSyncing,
    /// A session is active and healthy.
    Syncing(CompletionSignal),
    /// The session was active but has just been closed by the watchdog.
    Finished(SessionOutcome),
}

struct Session {
    state: SessionState,
    generation: u64,
    sender: Option<watch::Sender<Option<SessionOutcome>>>,
    last_activity: Instant,
    reason: String,
    recovery_scheduled: bool,
    keys: KeyRemapTable,
    rejections: HashMap<(String, RecordKey), TransportFailure>,
    /// The replay owning `generation` has not finished yet.
    draining: bool,
}

impl Session {
    fn signal(&self) -> Option<CompletionSignal> {
        self.sender.as_ref().map(|sender| CompletionSignal {
            generation: self.generation,
            receiver: sender.subscribe(),
        })
    }

    fn close(&mut self, reason: &str, outcome: SessionOutcome) -> bool {
        if self.state == SessionState::Idle {
            return false;
        }
        self.state = SessionState::Idle;
        self.reason = reason.to_string();
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome.clone()));
        }
        match outcome {
            SessionOutcome::Completed => {
                info!(generation = self.generation, reason, "sync session completed")
            }
            _ => warn!(generation = self.generation, reason, ?outcome, "sync session failed"),
        }
        true
    }
}

struct ContextInner {
    session: Mutex<Session>,
    outstanding: AtomicUsize,
    stall_timeout: Duration,
    disposed: AtomicBool,
}

/// Explicit owner of the session state machine and the key remap table.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl SyncContext {
    /// Creates an idle context with the given stall threshold.
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                session: Mutex::new(Session {
                    state: SessionState::Idle,
                    generation: 0,
                    sender: None,
                    last_activity: Instant::now(),
                    reason: String::new(),
                    recovery_scheduled: false,
                    keys: KeyRemapTable::new(),
                    rejections: HashMap::new(),
                    draining: false,
                }),
                outstanding: AtomicUsize::new(0),
                stall_timeout,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The watchdog threshold.
    pub fn stall_timeout(&self) -> Duration {
        self.inner.stall_timeout
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state
    }

    /// Returns true while a session is active.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Number of sessions opened so far.
    pub fn generation(&self) -> u64 {
        self.inner.session.lock().generation
    }

    /// The reason passed to the last `start` or `stop`.
    pub fn last_reason(&self) -> String {
        self.inner.session.lock().reason.clone()
    }

    /// The signal of the active session, if any.
    pub fn signal(&self) -> Option<CompletionSignal> {
        self.inner.session.lock().signal()
    }

    /// Opens a session, or joins the active one.
    pub fn start(&self, reason: &str) -> SessionStart {
        let mut session = self.inner.session.lock();
        if session.state == SessionState::Active {
            debug!(generation = session.generation, reason, "joining active sync session");
            session.reason = reason.to_string();
            if let Some(signal) = session.signal() {
                return SessionStart::Joined(signal);
            }
        }

        let (sender, _) = watch::channel(None);
        session.state = SessionState::Active;
        session.sender = Some(sender);
        session.last_activity = Instant::now();
        session.reason = reason.to_string();

        if session.draining {
            info!(generation = session.generation, reason, "sync session reopened for running replay");
            if let Some(signal) = session.signal() {
                return SessionStart::Joined(signal);
            }
        }

        session.generation += 1;
        session.draining = true;
        session.recovery_scheduled = false;
        session.keys.reset();
        session.rejections.clear();
        info!(generation = session.generation, reason, "sync session started");

        SessionStart::Started(SessionGuard {
            context: self.clone(),
            generation: session.generation,
            finished: false,
        })
    }

    /// Closes the active session. No-op when idle. Returns true if a session
    /// was closed.
    pub fn stop(&self, reason: &str, success: bool) -> bool {
        let outcome = if success {
            SessionOutcome::Completed
        } else {
            SessionOutcome::Failed(reason.to_string())
        };
        self.inner.session.lock().close(reason, outcome)
    }

    fn stop_generation(&self, generation: u64, reason: &str, outcome: SessionOutcome) -> bool {
        let mut session = self.inner.session.lock();
        if session.generation != generation {
            return false;
        }
        session.draining = false;
        session.close(reason, outcome)
    }

    /// Checks the active session and closes it if it stalled.
    ///
    /// A session is stalled when no transport call is outstanding and no
    /// activity has been recorded for longer than the stall threshold.
    pub fn check(&self) -> SessionCheck {
        let mut session = self.inner.session.lock();
        if session.state == SessionState::Idle {
            return SessionCheck::NotSyncing;
        }

        let now = Instant::now();
        if self.inner.outstanding.load(Ordering::SeqCst) > 0 {
            session.last_activity = now;
        } else if now.duration_since(session.last_activity) > self.inner.stall_timeout {
            session.draining = false;
            session.close(STALL_REASON, SessionOutcome::Stalled);
            return SessionCheck::Finished(SessionOutcome::Stalled);
        }

        match session.signal() {
            Some(signal) => SessionCheck::Syncing(signal),
            None => SessionCheck::NotSyncing,
        }
    }

    /// Waits on a session signal, probing every stall interval so a stalled
    /// session is force-closed even if nobody else checks it.
    pub async fn join(&self, mut signal: CompletionSignal) -> SessionOutcome {
        loop {
            match tokio::time::timeout(self.inner.stall_timeout, signal.wait()).await {
                Ok(outcome) => return outcome,
                Err(_) => {
                    if let SessionCheck::Finished(outcome) = self.check() {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Joins the active session if there is one. Returns `None` when idle.
    pub async fn join_active(&self) -> Option<SessionOutcome> {
        let signal = self.signal()?;
        Some(self.join(signal).await)
    }

    /// Marks one transport call as outstanding until the returned guard drops.
    pub fn track_transport(&self) -> TransportActivity {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.touch();
        TransportActivity {
            context: self.clone(),
        }
    }

    /// Number of transport calls currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.inner.session.lock().last_activity = Instant::now();
    }

    /// Claims the one forced refetch allowed per session. Returns false if
    /// one was already scheduled.
    pub fn schedule_recovery(&self) -> bool {
        let mut session = self.inner.session.lock();
        if session.recovery_scheduled {
            return false;
        }
        session.recovery_scheduled = true;
        true
    }

    /// Returns true if a forced refetch was already scheduled this session.
    pub fn recovery_scheduled(&self) -> bool {
        self.inner.session.lock().recovery_scheduled
    }

    /// Remembers that the server rejected the submission of `key`, so
    /// callers that joined the session can report it.
    pub fn record_rejection(&self, namespace: &str, key: &RecordKey, failure: TransportFailure) {
        self.inner
            .session
            .lock()
            .rejections
            .insert((namespace.to_string(), key.clone()), failure);
    }

    /// The rejection recorded for `key` in the current or last session.
    pub fn rejection(&self, namespace: &str, key: &RecordKey) -> Option<TransportFailure> {
        self.inner
            .session
            .lock()
            .rejections
            .get(&(namespace.to_string(), key.clone()))
            .cloned()
    }

    /// Runs `f` with the key remap table.
    pub fn with_keys<R>(&self, f: impl FnOnce(&mut KeyRemapTable) -> R) -> R {
        f(&mut self.inner.session.lock().keys)
    }

    /// Looks up a temporary key in the remap table.
    pub fn remap_entry(&self, temporary: &RecordKey) -> Option<RemapEntry> {
        self.with_keys(|keys| keys.get(temporary).cloned())
    }

    /// Closes any active session as failed, then clears the remap table and
    /// the recovery flag.
    pub fn reset(&self) {
        let mut session = self.inner.session.lock();
        session.draining = false;
        session.close("reset", SessionOutcome::Failed("reset".into()));
        session.keys.reset();
        session.rejections.clear();
        session.recovery_scheduled = false;
    }

    /// Resets the context and marks it disposed.
    pub fn dispose(&self) {
        self.reset();
        self.inner.disposed.store(true, Ordering::SeqCst);
        debug!("sync context disposed");
    }

    /// Returns true once [`SyncContext::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("SyncContext")
            .field("state", &session.state)
            .field("generation", &session.generation)
            .field("reason", &session.reason)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Ownership of an opened session.
///
/// The holder must call [`SessionGuard::finish`]. A guard dropped without
/// finishing closes its own session as failed; it never touches a later
/// session.
#[derive(Debug)]
pub struct SessionGuard {
    context: SyncContext,
    generation: u64,
    finished: bool,
}

impl SessionGuard {
    /// The session this guard owns.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The context the session belongs to.
    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    /// Returns true once this session was abandoned by the watchdog or a
    /// reset, or a newer session has started. A replay holding a superseded
    /// guard must stop submitting.
    pub fn is_superseded(&self) -> bool {
        let session = self.context.inner.session.lock();
        session.generation != self.generation || !session.draining
    }

    /// Closes the session.
    pub fn finish(mut self, reason: &str, success: bool) {
        self.finished = true;
        let outcome = if success {
            SessionOutcome::Completed
        } else {
            SessionOutcome::Failed(reason.to_string())
        };
        self.context.stop_generation(self.generation, reason, outcome);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.context.stop_generation(
                self.generation,
                "aborted",
                SessionOutcome::Failed("aborted".into()),
            );
        }
    }
}

/// An outstanding transport call. Records activity on creation and drop.
#[derive(Debug)]
pub struct TransportActivity {
    context: SyncContext,
}

impl Drop for TransportActivity {
    fn drop(&mut self) {
        self.context.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.context.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn context() -> SyncContext {
        SyncContext::new(Duration::from_secs(10))
    }

    fn started(start: SessionStart) -> SessionGuard {
        match start {
            SessionStart::Started(guard) => guard,
            SessionStart::Joined(_) => panic!("expected a new session"),
        }
    }

    fn joined(start: SessionStart) -> CompletionSignal {
        match start {
            SessionStart::Joined(signal) => signal,
            SessionStart::Started(_) => panic!("expected to join"),
        }
    }

    #[tokio::test]
    async fn start_twice_joins_the_same_session() {
        let ctx = context();
        let guard = started(ctx.start("first"));
        let a = joined(ctx.start("second"));
        let b = joined(ctx.start("third"));

        assert!(a.same_session(&b));
        assert_eq!(ctx.generation(), 1);
        assert_eq!(ctx.last_reason(), "third");

        guard.finish("done", true);
        let (mut a, mut b) = (a, b);
        assert_eq!(a.wait().await, SessionOutcome::Completed);
        assert_eq!(b.wait().await, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn failure_reaches_every_joiner() {
        let ctx = context();
        let guard = started(ctx.start("replay"));
        let signal = joined(ctx.start("read"));

        guard.finish("server failure", false);
        assert_eq!(
            ctx.join(signal).await,
            SessionOutcome::Failed("server failure".into())
        );
        assert!(!ctx.is_active());
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let ctx = context();
        assert!(!ctx.stop("nothing", true));
        assert!(matches!(ctx.check(), SessionCheck::NotSyncing));
    }

    #[test]
    fn new_session_resets_keys_and_recovery_flag() {
        let ctx = context();
        let guard = started(ctx.start("one"));
        ctx.with_keys(|keys| keys.put(RecordKey::generate(), RecordKey::new("1")));
        assert!(ctx.schedule_recovery());
        assert!(!ctx.schedule_recovery());

        // joining does not reset
        let _ = joined(ctx.start("mid-flight"));
        assert_eq!(ctx.with_keys(|keys| keys.len()), 1);

        guard.finish("done", true);
        let _guard = started(ctx.start("two"));
        assert_eq!(ctx.with_keys(|keys| keys.len()), 0);
        assert!(!ctx.recovery_scheduled());
    }

    #[test]
    fn rejections_live_until_next_session() {
        let ctx = context();
        let key = RecordKey::new("4");
        let guard = started(ctx.start("replay"));
        ctx.record_rejection("/todos", &key, TransportFailure::new(500, Value::Null));
        guard.finish("done", true);

        assert_eq!(ctx.rejection("/todos", &key).map(|f| f.status), Some(500));
        assert!(ctx.rejection("/notes", &key).is_none());

        let _guard = started(ctx.start("next"));
        assert!(ctx.rejection("/todos", &key).is_none());
    }

    #[test]
    fn dropped_guard_fails_its_session() {
        let ctx = context();
        let guard = started(ctx.start("replay"));
        let signal = ctx.signal().unwrap();
        drop(guard);

        assert!(!ctx.is_active());
        assert_eq!(signal.outcome(), Some(SessionOutcome::Failed("aborted".into())));
    }

    #[test]
    fn stale_guard_does_not_close_a_newer_session() {
        let ctx = context();
        let old = started(ctx.start("one"));
        ctx.reset();
        assert!(old.is_superseded());
        let new = started(ctx.start("two"));

        drop(old);
        assert!(ctx.is_active());
        assert_eq!(ctx.generation(), 2);
        assert!(!new.is_superseded());
    }

    #[tokio::test]
    async fn start_after_stop_rejoins_a_draining_replay() {
        let ctx = context();
        let guard = started(ctx.start("replay"));
        let temporary = RecordKey::generate();
        ctx.with_keys(|keys| keys.put(temporary.clone(), RecordKey::new("1")));

        assert!(ctx.stop("offline read", true));
        assert!(!ctx.is_active());
        assert!(!guard.is_superseded());

        let signal = joined(ctx.start("replay again"));
        assert!(ctx.is_active());
        assert_eq!(ctx.generation(), 1);
        assert_eq!(signal.generation(), 1);
        assert_eq!(
            ctx.with_keys(|keys| keys.resolve(&temporary)),
            Some(RecordKey::new("1"))
        );

        guard.finish("done", true);
        assert_eq!(ctx.join(signal).await, SessionOutcome::Completed);

        let _next = started(ctx.start("later"));
        assert_eq!(ctx.generation(), 2);
        assert!(ctx.with_keys(|keys| keys.resolve(&temporary)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_replay_is_superseded() {
        let ctx = context();
        let guard = started(ctx.start("replay"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(ctx.check(), SessionCheck::Finished(_)));
        assert!(guard.is_superseded());
        assert_eq!(ctx.generation(), 1);

        let _fresh = started(ctx.start("retry"));
        assert_eq!(ctx.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_closes_stalled_session() {
        let ctx = context();
        let _guard = started(ctx.start("replay"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(ctx.check(), SessionCheck::Syncing(_)));

        tokio::time::advance(Duration::from_millis(5_001)).await;
        match ctx.check() {
            SessionCheck::Finished(outcome) => assert_eq!(outcome, SessionOutcome::Stalled),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ctx.is_active());
        assert_eq!(ctx.last_reason(), STALL_REASON);
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_transport_keeps_session_alive() {
        let ctx = context();
        let _guard = started(ctx.start("replay"));
        let call = ctx.track_transport();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(ctx.check(), SessionCheck::Syncing(_)));

        drop(call);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(ctx.check(), SessionCheck::Finished(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn join_fires_the_watchdog() {
        let ctx = context();
        let _guard = started(ctx.start("replay"));
        let signal = ctx.signal().unwrap();

        let outcome = ctx.join(signal).await;
        assert_eq!(outcome, SessionOutcome::Stalled);
        assert!(matches!(
            outcome.into_result(),
            Err(SyncError::StallTimeout)
        ));
    }

    #[test]
    fn dispose_closes_session() {
        let ctx = context();
        let _guard = started(ctx.start("replay"));
        ctx.dispose();
        assert!(!ctx.is_active());
        assert!(ctx.is_disposed());
    }
}
